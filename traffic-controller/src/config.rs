use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BPF_FS_ROOT: &str = "/sys/fs/bpf";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const DEFAULT_QUOTA_PROC_DIR: &str = "/proc/net/xt_quota";
pub const DEFAULT_OFFLOAD_STATS_DIR: &str = "/data/misc/ipa";
pub const DEFAULT_OFFLOAD_STATS_FILE: &str = "tether_stats";
pub const DEFAULT_HW_TETHER_COUNTERS_CHAIN: &str = "natctrl_hw_tether_counters";
pub const DEFAULT_TETHER_COUNTERS_CHAIN: &str = "tetherctrl_counters";

/// Runtime configuration, loaded from JSON.
///
/// Every field has a default so a partial file only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub bpf_fs_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub iptables_path: String,
    pub ip6tables_path: String,
    pub iptables_restore_path: String,
    pub ip6tables_restore_path: String,
    pub quota_proc_dir: PathBuf,
    pub offload_stats_dir: PathBuf,
    pub offload_stats_file: String,
    pub hw_tether_counters_chain: String,
    pub tether_counters_chain: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bpf_fs_root: PathBuf::from(DEFAULT_BPF_FS_ROOT),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            iptables_path: "iptables".to_string(),
            ip6tables_path: "ip6tables".to_string(),
            iptables_restore_path: "iptables-restore".to_string(),
            ip6tables_restore_path: "ip6tables-restore".to_string(),
            quota_proc_dir: PathBuf::from(DEFAULT_QUOTA_PROC_DIR),
            offload_stats_dir: PathBuf::from(DEFAULT_OFFLOAD_STATS_DIR),
            offload_stats_file: DEFAULT_OFFLOAD_STATS_FILE.to_string(),
            hw_tether_counters_chain: DEFAULT_HW_TETHER_COUNTERS_CHAIN.to_string(),
            tether_counters_chain: DEFAULT_TETHER_COUNTERS_CHAIN.to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: ControllerConfig = serde_json::from_str(&contents)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("iptables_path", &self.iptables_path),
            ("ip6tables_path", &self.ip6tables_path),
            ("iptables_restore_path", &self.iptables_restore_path),
            ("ip6tables_restore_path", &self.ip6tables_restore_path),
            ("offload_stats_file", &self.offload_stats_file),
        ] {
            if value.trim().is_empty() {
                bail!("{name} must not be empty");
            }
        }
        for (name, chain) in [
            ("hw_tether_counters_chain", &self.hw_tether_counters_chain),
            ("tether_counters_chain", &self.tether_counters_chain),
        ] {
            if chain.is_empty() || chain.contains(char::is_whitespace) {
                bail!("{name} must be a single chain name, got {chain:?}");
            }
        }
        if self.offload_stats_file.contains('/') {
            bail!("offload_stats_file must be a bare file name");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "bpf_fs_root": "/tmp/bpf", "hw_tether_counters_chain": "hw_counters" }}"#
        )
        .unwrap();

        let cfg = ControllerConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.bpf_fs_root, PathBuf::from("/tmp/bpf"));
        assert_eq!(cfg.hw_tether_counters_chain, "hw_counters");
        assert_eq!(cfg.quota_proc_dir, PathBuf::from(DEFAULT_QUOTA_PROC_DIR));
        assert_eq!(cfg.iptables_restore_path, "iptables-restore");
    }

    #[test]
    fn rejects_chain_with_spaces() {
        let cfg = ControllerConfig {
            tether_counters_chain: "two words".to_string(),
            ..ControllerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tether_counters_chain"));
    }

    #[test]
    fn rejects_nested_offload_file() {
        let cfg = ControllerConfig {
            offload_stats_file: "ipa/tether_stats".to_string(),
            ..ControllerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let err = ControllerConfig::load(Some(Path::new("/nonexistent/tc.json"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tc.json"));
    }
}
