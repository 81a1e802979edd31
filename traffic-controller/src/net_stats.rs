//! Read side of the accounting tables.

use log::error;
use serde::Serialize;

use traffic_controller_common::{Generation, StatsKey, StatsValue};

use crate::{
    error::Result,
    map_store::KvMap,
    traffic_controller::{ControllerMaps, TrafficController},
};

/// Undercounting above this many bytes on unnamed interfaces is logged.
const MAX_UNKNOWN_IFACE_BYTES: u64 = 100 * 1000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Stats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

impl Stats {
    fn add(&mut self, value: &StatsValue) {
        self.rx_bytes += value.rx_bytes;
        self.rx_packets += value.rx_packets;
        self.tx_bytes += value.tx_bytes;
        self.tx_packets += value.tx_packets;
    }
}

impl From<StatsValue> for Stats {
    fn from(value: StatsValue) -> Self {
        let mut stats = Stats::default();
        stats.add(&value);
        stats
    }
}

/// One accounting bucket with its interface resolved.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StatsLine {
    pub iface: String,
    pub uid: u32,
    pub tag: u32,
    pub counter_set: u32,
    #[serde(flatten)]
    pub stats: Stats,
}

#[derive(Clone, Debug, Default)]
pub struct DetailFilter {
    /// Empty means every interface.
    pub ifaces: Vec<String>,
    pub tag: Option<u32>,
    pub uid: Option<u32>,
}

impl DetailFilter {
    fn accepts(&self, iface: &str, key: &StatsKey) -> bool {
        (self.ifaces.is_empty() || self.ifaces.iter().any(|i| i == iface))
            && self.tag.is_none_or(|t| t == key.tag)
            && self.uid.is_none_or(|u| u == key.uid)
    }
}

/// Bytes seen on interfaces without a name, logged once per read.
#[derive(Default)]
struct UnknownIfaceBytes {
    total: u64,
    logged: bool,
}

impl UnknownIfaceBytes {
    fn note(&mut self, ifindex: u32, value: Option<StatsValue>) {
        if self.logged {
            return;
        }
        let Some(value) = value else {
            return;
        };
        self.total += value.rx_bytes + value.tx_bytes;
        if self.total >= MAX_UNKNOWN_IFACE_BYTES {
            error!(
                "unknown name for ifindex {ifindex} with more than {} bytes of traffic",
                self.total
            );
            self.logged = true;
        }
    }
}

/// Per-UID aggregate; zero when the uid never sent or received.
pub fn uid_stats(controller: &TrafficController, uid: u32) -> Result<Stats> {
    let Some(maps) = controller.maps() else {
        return Ok(Stats::default());
    };
    Ok(maps
        .app_uid_stats
        .lookup(&uid)?
        .map(Stats::from)
        .unwrap_or_default())
}

/// Sums the per-interface aggregate for `iface`, or for every named
/// interface when `None`.
pub fn iface_stats(controller: &TrafficController, iface: Option<&str>) -> Result<Stats> {
    let mut stats = Stats::default();
    let Some(maps) = controller.maps() else {
        return Ok(stats);
    };
    let mut unknown = UnknownIfaceBytes::default();
    for ifindex in maps.iface_stats.keys()? {
        let Some(name) = maps.iface_name(ifindex)? else {
            unknown.note(ifindex, maps.iface_stats.lookup(&ifindex)?);
            continue;
        };
        if iface.is_some_and(|i| i != name) {
            continue;
        }
        if let Some(value) = maps.iface_stats.lookup(&ifindex)? {
            stats.add(&value);
        }
    }
    Ok(stats)
}

/// Every bucket of `generation` that passes `filter`.
pub fn stats_detail(
    controller: &TrafficController,
    filter: &DetailFilter,
    generation: Generation,
) -> Result<Vec<StatsLine>> {
    let Some(maps) = controller.maps() else {
        return Ok(Vec::new());
    };
    detail_lines(maps, maps.stats_map(generation), filter)
}

fn detail_lines(
    maps: &ControllerMaps,
    stats_map: &dyn KvMap<StatsKey, StatsValue>,
    filter: &DetailFilter,
) -> Result<Vec<StatsLine>> {
    let mut lines = Vec::new();
    let mut unknown = UnknownIfaceBytes::default();
    for key in stats_map.keys()? {
        let Some(iface) = maps.iface_name(key.iface_index)? else {
            unknown.note(key.iface_index, stats_map.lookup(&key)?);
            continue;
        };
        if !filter.accepts(&iface, &key) {
            continue;
        }
        // Deleted between the key walk and the lookup.
        let Some(value) = stats_map.lookup(&key)? else {
            continue;
        };
        lines.push(StatsLine {
            iface,
            uid: key.uid,
            tag: key.tag,
            counter_set: key.counter_set,
            stats: value.into(),
        });
    }
    Ok(lines)
}
