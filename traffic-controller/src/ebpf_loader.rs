use std::{
    convert::TryFrom,
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result, ensure};
use aya::{
    Ebpf, EbpfLoader, include_bytes_aligned,
    programs::{CgroupAttachMode, CgroupSkb, CgroupSkbAttachType},
};
use log::info;

use crate::config::ControllerConfig;

const EBPF_BYTES: &[u8] = include_bytes_aligned!(concat!(env!("OUT_DIR"), "/traffic-controller"));
const INGRESS_PROGRAM: &str = "cgroup_ingress";
const EGRESS_PROGRAM: &str = "cgroup_egress";

const PROGRAMS: [(&str, CgroupSkbAttachType); 2] = [
    (INGRESS_PROGRAM, CgroupSkbAttachType::Ingress),
    (EGRESS_PROGRAM, CgroupSkbAttachType::Egress),
];

/// Loads the accounting object, reusing maps already pinned under
/// `bpf_fs_root`, and attaches both programs to `cgroup_root`.
///
/// The returned handle must be kept alive; dropping it detaches the programs.
pub fn load_and_attach(config: &ControllerConfig) -> Result<Ebpf> {
    validate_cgroup_root(&config.cgroup_root)?;
    fs::create_dir_all(&config.bpf_fs_root)
        .with_context(|| format!("failed to create {}", config.bpf_fs_root.display()))?;

    let mut bpf = EbpfLoader::new()
        .map_pin_path(&config.bpf_fs_root)
        .load(EBPF_BYTES)
        .context("failed to load eBPF object")?;

    let cgroup = File::open(&config.cgroup_root)
        .with_context(|| format!("failed to open cgroup {}", config.cgroup_root.display()))?;

    for (name, attach_type) in PROGRAMS {
        attach_cgroup_skb(&mut bpf, &cgroup, name, attach_type)?;
        info!(
            "attached {name} to {}",
            config.cgroup_root.display()
        );
    }
    Ok(bpf)
}

fn validate_cgroup_root(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .with_context(|| format!("cgroup root {} not accessible", path.display()))?;
    ensure!(
        meta.is_dir(),
        "cgroup root {} is not a directory",
        path.display()
    );
    Ok(())
}

fn attach_cgroup_skb(
    bpf: &mut Ebpf,
    cgroup: &File,
    name: &str,
    attach_type: CgroupSkbAttachType,
) -> Result<()> {
    let program: &mut CgroupSkb = bpf
        .program_mut(name)
        .with_context(|| format!("program {name} not found"))?
        .try_into()
        .with_context(|| format!("{name} has wrong program type"))?;
    program
        .load()
        .with_context(|| format!("failed to load {name}"))?;
    program
        .attach(cgroup, attach_type, CgroupAttachMode::Single)
        .with_context(|| format!("failed to attach {name}"))?;
    Ok(())
}
