//! Pinned map lifecycle.
//!
//! Maps live under the bpf filesystem and survive restarts of this process.
//! [`set_up_map`] opens a pinned map when one exists. The daemon otherwise
//! creates and pins a fresh one, so the packet path keeps its tables across
//! restarts; one-shot commands only ever attach.

use std::{
    ffi::{CStr, CString},
    fs, io, mem,
    os::{
        fd::{FromRawFd, OwnedFd},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
};

use aya::{
    Pod,
    maps::{HashMap, Map, MapData, MapError},
};
use log::{debug, info};

use traffic_controller_common::{
    APP_UID_STATS_MAP, BPF_F_NO_PREALLOC, CONFIGURATION_MAP, CONFIGURATION_MAP_SIZE,
    COOKIE_TAG_MAP, COOKIE_UID_MAP_SIZE, IFACE_INDEX_NAME_MAP, IFACE_INDEX_NAME_MAP_SIZE,
    IFACE_STATS_MAP, IFACE_STATS_MAP_SIZE, IfaceValue, STATS_MAP_A, STATS_MAP_B, STATS_MAP_SIZE,
    StatsKey, StatsValue, UID_COUNTERSET_MAP, UID_COUNTERSET_MAP_SIZE, UID_OWNER_MAP,
    UID_OWNER_MAP_SIZE, UID_STATS_MAP_SIZE, UidOwnerValue, UidTag,
};

use crate::error::{ControllerError, Result};

const BPF_MAP_CREATE: libc::c_long = 0;
const BPF_OBJ_PIN: libc::c_long = 6;
const BPF_MAP_TYPE_HASH: u32 = 1;
const MIN_KERNEL_VERSION: (u32, u32) = (4, 9);

/// Shape of one kernel table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapSpec {
    pub name: &'static str,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

impl MapSpec {
    const fn hash<K, V>(name: &'static str, max_entries: u32) -> Self {
        Self {
            name,
            key_size: mem::size_of::<K>() as u32,
            value_size: mem::size_of::<V>() as u32,
            max_entries,
        }
    }

    pub fn pin_path(&self, root: &Path) -> PathBuf {
        root.join(self.name)
    }
}

pub const COOKIE_TAG_SPEC: MapSpec = MapSpec::hash::<u64, UidTag>(COOKIE_TAG_MAP, COOKIE_UID_MAP_SIZE);
pub const UID_COUNTERSET_SPEC: MapSpec =
    MapSpec::hash::<u32, u8>(UID_COUNTERSET_MAP, UID_COUNTERSET_MAP_SIZE);
pub const APP_UID_STATS_SPEC: MapSpec =
    MapSpec::hash::<u32, StatsValue>(APP_UID_STATS_MAP, UID_STATS_MAP_SIZE);
pub const STATS_A_SPEC: MapSpec = MapSpec::hash::<StatsKey, StatsValue>(STATS_MAP_A, STATS_MAP_SIZE);
pub const STATS_B_SPEC: MapSpec = MapSpec::hash::<StatsKey, StatsValue>(STATS_MAP_B, STATS_MAP_SIZE);
pub const IFACE_STATS_SPEC: MapSpec =
    MapSpec::hash::<u32, StatsValue>(IFACE_STATS_MAP, IFACE_STATS_MAP_SIZE);
pub const CONFIGURATION_SPEC: MapSpec =
    MapSpec::hash::<u32, u8>(CONFIGURATION_MAP, CONFIGURATION_MAP_SIZE);
pub const UID_OWNER_SPEC: MapSpec =
    MapSpec::hash::<u32, UidOwnerValue>(UID_OWNER_MAP, UID_OWNER_MAP_SIZE);
pub const IFACE_INDEX_NAME_SPEC: MapSpec =
    MapSpec::hash::<u32, IfaceValue>(IFACE_INDEX_NAME_MAP, IFACE_INDEX_NAME_MAP_SIZE);

pub const ALL_MAPS: [MapSpec; 9] = [
    COOKIE_TAG_SPEC,
    UID_COUNTERSET_SPEC,
    APP_UID_STATS_SPEC,
    STATS_A_SPEC,
    STATS_B_SPEC,
    IFACE_STATS_SPEC,
    CONFIGURATION_SPEC,
    UID_OWNER_SPEC,
    IFACE_INDEX_NAME_SPEC,
];

/// What to do when nothing is pinned at a map's path yet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    CreateIfMissing,
    ExistingOnly,
}

/// Opens the map pinned for `spec` under `root`. With
/// [`OpenMode::CreateIfMissing`] a missing map is created and pinned first.
pub fn set_up_map(spec: &MapSpec, root: &Path, mode: OpenMode) -> Result<MapData> {
    let path = spec.pin_path(root);
    let c_path = path_to_cstring(&path)?;

    if unsafe { libc::access(c_path.as_ptr(), libc::R_OK) } == 0 {
        let map = MapData::from_pin(&path).map_err(|err| ControllerError::MapAccess {
            path: path.clone(),
            reason: format!("pinned map not accessible or does not exist: {err}"),
        })?;
        check_shape(spec, &map, &path)?;
        debug!("reusing pinned map {}", path.display());
        return Ok(map);
    }

    let err = io::Error::last_os_error();
    if err.kind() != io::ErrorKind::NotFound {
        return Err(ControllerError::MapAccess {
            path,
            reason: format!("pinned map not accessible: {err}"),
        });
    }
    if mode == OpenMode::ExistingOnly {
        return Err(ControllerError::MapAccess {
            path,
            reason: "nothing pinned yet, start the daemon first".to_string(),
        });
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|source| ControllerError::MapCreate { path: path.clone(), source })?;
    }
    let fd = create_hash_map(spec).map_err(|source| ControllerError::MapCreate {
        path: path.clone(),
        source,
    })?;
    pin_fd(&fd, &c_path).map_err(|source| ControllerError::MapCreate {
        path: path.clone(),
        source,
    })?;
    drop(fd);
    info!("created map {} ({} entries)", path.display(), spec.max_entries);

    MapData::from_pin(&path).map_err(|err| ControllerError::MapAccess {
        path,
        reason: format!("freshly pinned map not accessible: {err}"),
    })
}

/// Like [`set_up_map`], converted to a typed hash map.
pub fn set_up_hash_map<K: Pod, V: Pod>(
    spec: &MapSpec,
    root: &Path,
    mode: OpenMode,
) -> Result<HashMap<MapData, K, V>> {
    // Every table is created as BPF_MAP_TYPE_HASH; `check_shape` covers sizes.
    let map = Map::HashMap(set_up_map(spec, root, mode)?);
    HashMap::<MapData, K, V>::try_from(map).map_err(|source| ControllerError::MapOperation {
        map: spec.name,
        op: "open",
        source,
    })
}

fn check_shape(spec: &MapSpec, map: &MapData, path: &Path) -> Result<()> {
    let info = map.info().map_err(|err| ControllerError::MapAccess {
        path: path.to_path_buf(),
        reason: format!("failed to query map info: {err}"),
    })?;
    if info.key_size() != spec.key_size || info.value_size() != spec.value_size {
        return Err(ControllerError::MapAccess {
            path: path.to_path_buf(),
            reason: format!(
                "wrong map type: key/value {}/{} bytes, expected {}/{}",
                info.key_size(),
                info.value_size(),
                spec.key_size,
                spec.value_size
            ),
        });
    }
    Ok(())
}

#[repr(C)]
#[derive(Default)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
}

#[repr(C)]
#[derive(Default)]
struct ObjPinAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

fn sys_bpf<T>(cmd: libc::c_long, attr: &T) -> io::Result<libc::c_long> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *const T,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

fn create_hash_map(spec: &MapSpec) -> io::Result<OwnedFd> {
    let attr = MapCreateAttr {
        map_type: BPF_MAP_TYPE_HASH,
        key_size: spec.key_size,
        value_size: spec.value_size,
        max_entries: spec.max_entries,
        map_flags: BPF_F_NO_PREALLOC,
    };
    let fd = sys_bpf(BPF_MAP_CREATE, &attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

fn pin_fd(fd: &OwnedFd, path: &CStr) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let attr = ObjPinAttr {
        pathname: path.as_ptr() as u64,
        bpf_fd: fd.as_raw_fd() as u32,
        file_flags: 0,
    };
    sys_bpf(BPF_OBJ_PIN, &attr).map(|_| ())
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ControllerError::InvalidArgument(format!("bad path {}", path.display())))
}

/// Whether the running kernel can host the cgroup classifier.
///
/// Fails closed: an unreadable or unparsable release string means no.
pub fn has_kernel_support() -> bool {
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return false;
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    match release.to_str().ok().and_then(parse_kernel_release) {
        Some(version) => version >= MIN_KERNEL_VERSION,
        None => false,
    }
}

/// Parses `major.minor` from a release string. At least one character must
/// follow the minor number, as in `4.9.0-generic`.
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let (major, rest) = release.split_once('.')?;
    let major: u32 = major.parse().ok()?;
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 || digits == rest.len() {
        return None;
    }
    let minor: u32 = rest[..digits].parse().ok()?;
    Some((major, minor))
}

/// Key/value table operations used by the controller. Every call maps
/// straight onto one kernel map operation and propagates its error.
pub trait KvMap<K, V>: Send {
    fn lookup(&self, key: &K) -> Result<Option<V>>;
    fn update(&mut self, key: K, value: V) -> Result<()>;
    /// Returns `false` when the key was not present.
    fn delete(&mut self, key: &K) -> Result<bool>;
    /// All keys, walked with get-next-key.
    fn keys(&self) -> Result<Vec<K>>;
}

/// A pinned kernel hash map with its name kept for error reporting.
pub struct PinnedMap<K, V> {
    name: &'static str,
    inner: HashMap<MapData, K, V>,
}

impl<K: Pod, V: Pod> PinnedMap<K, V> {
    pub fn open(spec: &MapSpec, root: &Path, mode: OpenMode) -> Result<Self> {
        Ok(Self {
            name: spec.name,
            inner: set_up_hash_map(spec, root, mode)?,
        })
    }

    fn op_error(&self, op: &'static str, source: MapError) -> ControllerError {
        ControllerError::MapOperation {
            map: self.name,
            op,
            source,
        }
    }
}

fn is_enoent(err: &MapError) -> bool {
    match err {
        MapError::KeyNotFound => true,
        MapError::SyscallError(e) => e.io_error.raw_os_error() == Some(libc::ENOENT),
        _ => false,
    }
}

impl<K: Pod + Send, V: Pod + Send> KvMap<K, V> for PinnedMap<K, V> {
    fn lookup(&self, key: &K) -> Result<Option<V>> {
        match self.inner.get(key, 0) {
            Ok(value) => Ok(Some(value)),
            Err(err) if is_enoent(&err) => Ok(None),
            Err(err) => Err(self.op_error("lookup", err)),
        }
    }

    fn update(&mut self, key: K, value: V) -> Result<()> {
        self.inner
            .insert(key, value, 0)
            .map_err(|err| self.op_error("update", err))
    }

    fn delete(&mut self, key: &K) -> Result<bool> {
        match self.inner.remove(key) {
            Ok(()) => Ok(true),
            Err(err) if is_enoent(&err) => Ok(false),
            Err(err) => Err(self.op_error("delete", err)),
        }
    }

    fn keys(&self) -> Result<Vec<K>> {
        self.inner
            .keys()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| self.op_error("get_next_key", err))
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;

    use super::*;

    /// In-process stand-in for a kernel hash map.
    pub struct MemoryMap<K, V> {
        pub entries: BTreeMap<K, V>,
        capacity: usize,
    }

    impl<K: Ord, V> MemoryMap<K, V> {
        pub fn new(capacity: usize) -> Self {
            Self {
                entries: BTreeMap::new(),
                capacity,
            }
        }
    }

    impl<K: Ord + Copy + Send, V: Copy + Send> KvMap<K, V> for MemoryMap<K, V> {
        fn lookup(&self, key: &K) -> Result<Option<V>> {
            Ok(self.entries.get(key).copied())
        }

        fn update(&mut self, key: K, value: V) -> Result<()> {
            if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
                return Err(ControllerError::io(
                    "memory map full",
                    io::Error::from_raw_os_error(libc::E2BIG),
                ));
            }
            self.entries.insert(key, value);
            Ok(())
        }

        fn delete(&mut self, key: &K) -> Result<bool> {
            Ok(self.entries.remove(key).is_some())
        }

        fn keys(&self) -> Result<Vec<K>> {
            Ok(self.entries.keys().copied().collect())
        }
    }
}
