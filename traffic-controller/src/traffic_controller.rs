//! Userspace side of the kernel accounting tables: socket tagging, counter
//! sets, owner rules and generation swaps.

use std::{
    collections::HashSet,
    fmt::Write as _,
    path::Path,
};

use chrono::Utc;
use log::{debug, error, info, warn};

use traffic_controller_common::{
    COUNTERSETS_LIMIT, CURRENT_STATS_MAP_CONFIGURATION_KEY, DOZABLE_MATCH, Generation, IIF_MATCH,
    IfaceValue, NONEXISTENT_UID, POWERSAVE_MATCH, STANDBY_MATCH, StatsKey, StatsValue,
    UID_RULES_CONFIGURATION_KEY, UidOwnerValue, UidTag,
};

use crate::{
    error::{ControllerError, Result},
    map_store::{
        APP_UID_STATS_SPEC, CONFIGURATION_SPEC, COOKIE_TAG_SPEC, IFACE_INDEX_NAME_SPEC,
        IFACE_STATS_SPEC, KvMap, OpenMode, PinnedMap, STATS_A_SPEC, STATS_B_SPEC, UID_COUNTERSET_SPEC,
        UID_OWNER_SPEC, has_kernel_support,
    },
};

/// Power-management owner rules. Dozable and powersave are allowlists,
/// standby is a denylist.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum OwnerRule {
    Dozable,
    Standby,
    Powersave,
}

impl OwnerRule {
    pub const fn match_bit(self) -> u8 {
        match self {
            OwnerRule::Dozable => DOZABLE_MATCH,
            OwnerRule::Standby => STANDBY_MATCH,
            OwnerRule::Powersave => POWERSAVE_MATCH,
        }
    }

    pub const fn is_allowlist(self) -> bool {
        !matches!(self, OwnerRule::Standby)
    }
}

pub type BoxedMap<K, V> = Box<dyn KvMap<K, V>>;

/// Every table shared with the cgroup programs.
pub struct ControllerMaps {
    pub cookie_tag: BoxedMap<u64, UidTag>,
    pub uid_counter_set: BoxedMap<u32, u8>,
    pub app_uid_stats: BoxedMap<u32, StatsValue>,
    pub stats_a: BoxedMap<StatsKey, StatsValue>,
    pub stats_b: BoxedMap<StatsKey, StatsValue>,
    pub iface_stats: BoxedMap<u32, StatsValue>,
    pub configuration: BoxedMap<u32, u8>,
    pub uid_owner: BoxedMap<u32, UidOwnerValue>,
    pub iface_index_name: BoxedMap<u32, IfaceValue>,
}

impl ControllerMaps {
    /// Opens every pinned map under `root`, creating missing ones when `mode`
    /// allows it.
    pub fn open(root: &Path, mode: OpenMode) -> Result<Self> {
        Ok(Self {
            cookie_tag: Box::new(PinnedMap::open(&COOKIE_TAG_SPEC, root, mode)?),
            uid_counter_set: Box::new(PinnedMap::open(&UID_COUNTERSET_SPEC, root, mode)?),
            app_uid_stats: Box::new(PinnedMap::open(&APP_UID_STATS_SPEC, root, mode)?),
            stats_a: Box::new(PinnedMap::open(&STATS_A_SPEC, root, mode)?),
            stats_b: Box::new(PinnedMap::open(&STATS_B_SPEC, root, mode)?),
            iface_stats: Box::new(PinnedMap::open(&IFACE_STATS_SPEC, root, mode)?),
            configuration: Box::new(PinnedMap::open(&CONFIGURATION_SPEC, root, mode)?),
            uid_owner: Box::new(PinnedMap::open(&UID_OWNER_SPEC, root, mode)?),
            iface_index_name: Box::new(PinnedMap::open(&IFACE_INDEX_NAME_SPEC, root, mode)?),
        })
    }

    pub fn stats_map(&self, generation: Generation) -> &dyn KvMap<StatsKey, StatsValue> {
        match generation {
            Generation::A => self.stats_a.as_ref(),
            Generation::B => self.stats_b.as_ref(),
        }
    }

    fn stats_map_mut(&mut self, generation: Generation) -> &mut dyn KvMap<StatsKey, StatsValue> {
        match generation {
            Generation::A => self.stats_a.as_mut(),
            Generation::B => self.stats_b.as_mut(),
        }
    }

    /// The generation the programs currently charge. An absent or unknown
    /// entry reads as A, matching the kernel side.
    pub fn active_generation(&self) -> Result<Generation> {
        Ok(self
            .configuration
            .lookup(&CURRENT_STATS_MAP_CONFIGURATION_KEY)?
            .and_then(Generation::from_config)
            .unwrap_or(Generation::A))
    }

    pub fn iface_name(&self, ifindex: u32) -> Result<Option<String>> {
        Ok(self
            .iface_index_name
            .lookup(&ifindex)?
            .map(|v| v.name().to_string()))
    }
}

/// Owns the map handles. Without kernel support it stays disabled and every
/// operation succeeds without touching anything.
pub struct TrafficController {
    maps: Option<ControllerMaps>,
}

impl TrafficController {
    pub fn disabled() -> Self {
        Self { maps: None }
    }

    pub fn with_maps(maps: ControllerMaps) -> Result<Self> {
        let mut controller = Self { maps: Some(maps) };
        controller.init_configuration()?;
        Ok(controller)
    }

    /// Gates on the running kernel, then opens every map under `bpf_fs_root`.
    pub fn start(bpf_fs_root: &Path) -> Result<Self> {
        if !has_kernel_support() {
            warn!("kernel lacks cgroup accounting support, traffic controller disabled");
            return Ok(Self::disabled());
        }
        let maps = ControllerMaps::open(bpf_fs_root, OpenMode::CreateIfMissing)?;
        info!("traffic controller maps ready under {}", bpf_fs_root.display());
        Self::with_maps(maps)
    }

    /// Opens the maps a running daemon has already pinned. Nothing is created
    /// and the configuration entries are left as they are.
    pub fn attach_existing(bpf_fs_root: &Path) -> Result<Self> {
        if !has_kernel_support() {
            warn!("kernel lacks cgroup accounting support, traffic controller disabled");
            return Ok(Self::disabled());
        }
        let maps = ControllerMaps::open(bpf_fs_root, OpenMode::ExistingOnly)?;
        Ok(Self { maps: Some(maps) })
    }

    pub fn is_enabled(&self) -> bool {
        self.maps.is_some()
    }

    pub fn maps(&self) -> Option<&ControllerMaps> {
        self.maps.as_ref()
    }

    /// Seeds the configuration entries without overwriting state left by a
    /// previous run.
    fn init_configuration(&mut self) -> Result<()> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        if maps.configuration.lookup(&UID_RULES_CONFIGURATION_KEY)?.is_none() {
            maps.configuration.update(UID_RULES_CONFIGURATION_KEY, 0)?;
        }
        if maps
            .configuration
            .lookup(&CURRENT_STATS_MAP_CONFIGURATION_KEY)?
            .is_none()
        {
            maps.configuration.update(
                CURRENT_STATS_MAP_CONFIGURATION_KEY,
                Generation::A.config_value(),
            )?;
        }
        Ok(())
    }

    pub fn tag_socket(&mut self, cookie: u64, tag: u32, uid: u32) -> Result<()> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        maps.cookie_tag
            .update(cookie, UidTag { uid, tag })
            .inspect_err(|e| error!("failed to tag socket cookie {cookie}: {e}"))
    }

    pub fn untag_socket(&mut self, cookie: u64) -> Result<()> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        if maps.cookie_tag.delete(&cookie)? {
            Ok(())
        } else {
            Err(ControllerError::NotInState(format!("socket cookie {cookie}")))
        }
    }

    /// Set 0 is the default and is stored as an absent entry.
    pub fn set_counter_set(&mut self, counter_set: u32, uid: u32) -> Result<()> {
        if counter_set >= COUNTERSETS_LIMIT {
            return Err(ControllerError::InvalidArgument(format!(
                "counter set {counter_set} out of range"
            )));
        }
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        if counter_set == 0 {
            maps.uid_counter_set.delete(&uid)?;
            return Ok(());
        }
        maps.uid_counter_set.update(uid, counter_set as u8)
    }

    /// Drops every cookie and stats entry of `uid` carrying `tag`, or every tag
    /// when `tag` is 0. Tag 0 also forgets the uid's counter set and aggregate.
    pub fn delete_tag_data(&mut self, tag: u32, uid: u32) -> Result<()> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        let matches = |t: u32| tag == 0 || t == tag;

        for cookie in maps.cookie_tag.keys()? {
            let Some(owner) = maps.cookie_tag.lookup(&cookie)? else {
                continue;
            };
            if owner.uid == uid && matches(owner.tag) {
                maps.cookie_tag.delete(&cookie)?;
            }
        }

        for generation in [Generation::A, Generation::B] {
            let map = maps.stats_map_mut(generation);
            for key in map.keys()? {
                if key.uid == uid && matches(key.tag) {
                    map.delete(&key)?;
                }
            }
        }

        if tag != 0 {
            return Ok(());
        }
        maps.uid_counter_set.delete(&uid)?;
        maps.app_uid_stats.delete(&uid)?;
        debug!("deleted all tag data for uid {uid}");
        Ok(())
    }

    pub fn add_interface(&mut self, name: &str, ifindex: u32) -> Result<()> {
        if ifindex == 0 {
            return Err(ControllerError::InvalidArgument(format!(
                "unknown interface {name}({ifindex})"
            )));
        }
        let value = IfaceValue::from_name(name)
            .ok_or_else(|| ControllerError::InvalidArgument(format!("bad interface name {name:?}")))?;
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        maps.iface_index_name.update(ifindex, value)
    }

    /// `allow` admits the uid under `rule`; for a denylist rule that clears
    /// its bit.
    pub fn change_uid_owner_rule(&mut self, rule: OwnerRule, uid: u32, allow: bool) -> Result<()> {
        check_owner_uid(uid)?;
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        if allow == rule.is_allowlist() {
            add_owner_match(maps, uid, rule.match_bit(), 0)
        } else {
            remove_owner_match(maps, uid, rule.match_bit())
        }
    }

    /// Makes `uids` the exact member set of `rule`.
    pub fn replace_uid_owner_rules(&mut self, rule: OwnerRule, uids: &[u32]) -> Result<()> {
        for uid in uids {
            check_owner_uid(*uid)?;
        }
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        let keep: HashSet<u32> = uids.iter().copied().collect();
        let bit = rule.match_bit();
        for uid in maps.uid_owner.keys()? {
            if keep.contains(&uid) {
                continue;
            }
            let member = maps
                .uid_owner
                .lookup(&uid)?
                .is_some_and(|entry| entry.rule & bit != 0);
            if member {
                remove_owner_match(maps, uid, bit)?;
            }
        }
        for uid in uids {
            add_owner_match(maps, *uid, bit, 0)?;
        }
        Ok(())
    }

    /// Restricts `uid` to ingress on `ifindex`; 0 lifts the restriction.
    pub fn set_allowed_iif(&mut self, uid: u32, ifindex: u32) -> Result<()> {
        check_owner_uid(uid)?;
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        if ifindex == 0 {
            remove_owner_match(maps, uid, IIF_MATCH)
        } else {
            add_owner_match(maps, uid, IIF_MATCH, ifindex)
        }
    }

    pub fn toggle_uid_owner_rule(&mut self, rule: OwnerRule, enable: bool) -> Result<()> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(());
        };
        let current = maps
            .configuration
            .lookup(&UID_RULES_CONFIGURATION_KEY)?
            .unwrap_or(0);
        let next = if enable {
            current | rule.match_bit()
        } else {
            current & !rule.match_bit()
        };
        maps.configuration.update(UID_RULES_CONFIGURATION_KEY, next)
    }

    /// Points the programs at the other generation and returns the one that
    /// was active, which is now safe to read. In-flight packets may still
    /// charge the old generation briefly.
    pub fn swap_active_stats_map(&mut self) -> Result<Generation> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(Generation::A);
        };
        let previous = maps.active_generation()?;
        maps.configuration.update(
            CURRENT_STATS_MAP_CONFIGURATION_KEY,
            previous.other().config_value(),
        )?;
        info!("stats generation {previous:?} -> {:?}", previous.other());
        Ok(previous)
    }

    /// Removes tagged buckets whose (uid, tag) no longer belongs to any socket.
    /// Returns how many were removed.
    pub fn clean_stats_map(&mut self) -> Result<usize> {
        let Some(maps) = self.maps.as_mut() else {
            return Ok(0);
        };
        let mut live = HashSet::new();
        for cookie in maps.cookie_tag.keys()? {
            if let Some(owner) = maps.cookie_tag.lookup(&cookie)? {
                live.insert((owner.uid, owner.tag));
            }
        }
        let mut removed = 0;
        for generation in [Generation::A, Generation::B] {
            let map = maps.stats_map_mut(generation);
            for key in map.keys()? {
                if key.tag != 0 && !live.contains(&(key.uid, key.tag)) && map.delete(&key)? {
                    removed += 1;
                }
            }
        }
        debug!("removed {removed} stale tagged stats entries");
        Ok(removed)
    }

    /// Human-readable listing of every table.
    pub fn dump(&self) -> Result<String> {
        let mut out = String::new();
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S");
        let _ = writeln!(out, "TrafficController ({now} UTC)");
        let Some(maps) = self.maps.as_ref() else {
            let _ = writeln!(out, "  BPF module status: OFF");
            return Ok(out);
        };
        let _ = writeln!(out, "  BPF module status: ON");

        let _ = writeln!(out, "\n  cookie tag map:");
        for cookie in maps.cookie_tag.keys()? {
            if let Some(owner) = maps.cookie_tag.lookup(&cookie)? {
                let _ = writeln!(
                    out,
                    "    cookie={cookie} tag={:#x} uid={}",
                    owner.tag, owner.uid
                );
            }
        }

        let _ = writeln!(out, "\n  uid counter set map:");
        for uid in maps.uid_counter_set.keys()? {
            if let Some(set) = maps.uid_counter_set.lookup(&uid)? {
                let _ = writeln!(out, "    {uid} {set}");
            }
        }

        let _ = writeln!(out, "\n  app uid stats map:");
        let _ = writeln!(out, "    uid rxBytes rxPackets txBytes txPackets");
        for uid in maps.app_uid_stats.keys()? {
            if let Some(v) = maps.app_uid_stats.lookup(&uid)? {
                let _ = writeln!(
                    out,
                    "    {uid} {} {} {} {}",
                    v.rx_bytes, v.rx_packets, v.tx_bytes, v.tx_packets
                );
            }
        }

        let active = maps.active_generation()?;
        for generation in [Generation::A, Generation::B] {
            let marker = if generation == active { " (active)" } else { "" };
            let _ = writeln!(out, "\n  stats map {generation:?}{marker}:");
            let _ = writeln!(
                out,
                "    ifaceIndex ifaceName tag_hex uid_int cnt_set rxBytes rxPackets txBytes txPackets"
            );
            let map = maps.stats_map(generation);
            for key in map.keys()? {
                let Some(v) = map.lookup(&key)? else {
                    continue;
                };
                let name = maps
                    .iface_name(key.iface_index)?
                    .unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(
                    out,
                    "    {} {name} {:#x} {} {} {} {} {} {}",
                    key.iface_index,
                    key.tag,
                    key.uid,
                    key.counter_set,
                    v.rx_bytes,
                    v.rx_packets,
                    v.tx_bytes,
                    v.tx_packets
                );
            }
        }

        let _ = writeln!(out, "\n  iface index name map:");
        for ifindex in maps.iface_index_name.keys()? {
            if let Some(name) = maps.iface_name(ifindex)? {
                let _ = writeln!(out, "    ifaceIndex={ifindex} ifaceName={name}");
            }
        }

        let _ = writeln!(out, "\n  iface stats map:");
        let _ = writeln!(out, "    ifaceIndex ifaceName rxBytes rxPackets txBytes txPackets");
        for ifindex in maps.iface_stats.keys()? {
            if let Some(v) = maps.iface_stats.lookup(&ifindex)? {
                let name = maps
                    .iface_name(ifindex)?
                    .unwrap_or_else(|| "unknown".to_string());
                let _ = writeln!(
                    out,
                    "    {ifindex} {name} {} {} {} {}",
                    v.rx_bytes, v.rx_packets, v.tx_bytes, v.tx_packets
                );
            }
        }

        let enabled = maps
            .configuration
            .lookup(&UID_RULES_CONFIGURATION_KEY)?
            .unwrap_or(0);
        let _ = writeln!(out, "\n  enabled owner rules: {enabled:#04x}");
        let _ = writeln!(out, "  uid owner map:");
        for uid in maps.uid_owner.keys()? {
            if let Some(v) = maps.uid_owner.lookup(&uid)? {
                let _ = writeln!(out, "    {uid} rule={:#04x} iif={}", v.rule, v.iif);
            }
        }
        Ok(out)
    }
}

fn check_owner_uid(uid: u32) -> Result<()> {
    if uid == NONEXISTENT_UID {
        return Err(ControllerError::InvalidArgument(format!(
            "uid {uid} never owns sockets"
        )));
    }
    Ok(())
}

fn add_owner_match(maps: &mut ControllerMaps, uid: u32, bit: u8, iif: u32) -> Result<()> {
    let mut entry = maps.uid_owner.lookup(&uid)?.unwrap_or_default();
    entry.rule |= bit;
    if bit == IIF_MATCH {
        entry.iif = iif;
    }
    maps.uid_owner.update(uid, entry)
}

/// Clears `bit`, dropping the entry once nothing is left in it.
fn remove_owner_match(maps: &mut ControllerMaps, uid: u32, bit: u8) -> Result<()> {
    let Some(mut entry) = maps.uid_owner.lookup(&uid)? else {
        return Ok(());
    };
    entry.rule &= !bit;
    if bit == IIF_MATCH {
        entry.iif = 0;
    }
    if entry.rule == 0 {
        maps.uid_owner.delete(&uid)?;
        Ok(())
    } else {
        maps.uid_owner.update(uid, entry)
    }
}
