//! Per interface-pair counters recovered from `iptables -nvx -L` output of the
//! tethering counters chain.

use serde::Serialize;

use crate::{
    backend::{FailureLog, IpVersion, RuleBackend},
    error::{ControllerError, Result},
    rules::RuleDirective,
};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TetherStats {
    pub int_iface: String,
    pub ext_iface: String,
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
}

impl TetherStats {
    /// Adds `other` into `self` when both describe the same pair.
    pub fn add_stats_if_match(&mut self, other: &TetherStats) -> bool {
        if self.int_iface != other.int_iface || self.ext_iface != other.ext_iface {
            return false;
        }
        self.rx_bytes += other.rx_bytes;
        self.rx_packets += other.rx_packets;
        self.tx_bytes += other.tx_bytes;
        self.tx_packets += other.tx_packets;
        true
    }
}

/// Merges `stats` into the entry for its pair, or appends it.
pub fn merge_into(list: &mut Vec<TetherStats>, stats: TetherStats) {
    if !list.iter_mut().any(|s| s.add_stats_if_match(&stats)) {
        list.push(stats);
    }
}

/// Interfaces to restrict parsing to. Neither set means every pair.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TetherFilter {
    pub int_iface: Option<String>,
    pub ext_iface: Option<String>,
}

impl TetherFilter {
    pub fn is_filtering(&self) -> bool {
        self.int_iface.is_some() || self.ext_iface.is_some()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Side {
    Rx,
    Tx,
}

const FOUND_RX: u8 = 1 << 0;
const FOUND_TX: u8 = 1 << 1;
const FOUND_BOTH: u8 = FOUND_RX | FOUND_TX;

struct CounterLine<'a> {
    packets: i64,
    bytes: i64,
    iface_in: &'a str,
    iface_out: &'a str,
}

/// Accepts the v4 shape `pkts bytes RETURN all -- in out 0.0.0.0/0 ...` and
/// the v6 shape `pkts bytes RETURN all in out ::/0 ...`.
fn parse_counter_line(line: &str) -> Option<CounterLine<'_>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let (iface_in, iface_out, source) = if line.contains("0.0.0.0") {
        if tokens.get(4) != Some(&"--") {
            return None;
        }
        (tokens.get(5)?, tokens.get(6)?, tokens.get(7)?)
    } else {
        (tokens.get(4)?, tokens.get(5)?, tokens.get(6)?)
    };
    let source_ok = source.starts_with("0.") || source.starts_with("::/");
    if tokens.get(2) != Some(&"RETURN") || tokens.get(3) != Some(&"all") || !source_ok {
        return None;
    }
    Some(CounterLine {
        packets: tokens.first()?.parse().ok()?,
        bytes: tokens.get(1)?.parse().ok()?,
        iface_in,
        iface_out,
    })
}

/// `Chain <name> (...)` or the `pkts bytes target ...` column line.
fn is_header_line(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("Chain") => true,
        Some("pkts") => tokens.next() == Some("bytes"),
        _ => false,
    }
}

/// Pairs up forward-chain counter lines.
///
/// The first line seen for a pair (`in` = internal) is its rx side and the
/// line with the interfaces swapped its tx side. With both filter interfaces
/// set, parsing stops as soon as that one pair is complete.
///
/// A listing with headers but no counters is an idle chain and yields no
/// pairs. Unfiltered output with neither is an error.
pub fn parse_forward_chain_stats(output: &str, filter: &TetherFilter) -> Result<Vec<TetherStats>> {
    let mut pairs: Vec<(TetherStats, u8)> = Vec::new();
    let mut saw_header = false;

    for line in output.lines() {
        if is_header_line(line) {
            saw_header = true;
            continue;
        }
        let Some(counter) = parse_counter_line(line) else {
            continue;
        };
        let (i0, i1) = (counter.iface_in, counter.iface_out);

        let (int_iface, ext_iface, side) =
            match (filter.int_iface.as_deref(), filter.ext_iface.as_deref()) {
                (Some(int), Some(ext)) => {
                    if (i0, i1) == (int, ext) {
                        (i0, i1, Side::Rx)
                    } else if (i1, i0) == (int, ext) {
                        (i1, i0, Side::Tx)
                    } else {
                        continue;
                    }
                }
                (Some(int), None) => {
                    if i0 == int {
                        (i0, i1, Side::Rx)
                    } else if i1 == int {
                        (i1, i0, Side::Tx)
                    } else {
                        continue;
                    }
                }
                (None, Some(ext)) => {
                    if i1 == ext {
                        (i0, i1, Side::Rx)
                    } else if i0 == ext {
                        (i1, i0, Side::Tx)
                    } else {
                        continue;
                    }
                }
                (None, None) => {
                    let reverse_pending = pairs
                        .iter()
                        .any(|(s, _)| s.int_iface == i1 && s.ext_iface == i0);
                    if reverse_pending {
                        (i1, i0, Side::Tx)
                    } else {
                        (i0, i1, Side::Rx)
                    }
                }
            };

        let idx = match pairs
            .iter()
            .position(|(s, _)| s.int_iface == int_iface && s.ext_iface == ext_iface)
        {
            Some(idx) => idx,
            None => {
                pairs.push((
                    TetherStats {
                        int_iface: int_iface.to_string(),
                        ext_iface: ext_iface.to_string(),
                        ..TetherStats::default()
                    },
                    0,
                ));
                pairs.len() - 1
            }
        };
        let (stats, found) = &mut pairs[idx];
        match side {
            Side::Rx => {
                stats.rx_packets = counter.packets;
                stats.rx_bytes = counter.bytes;
                *found |= FOUND_RX;
            }
            Side::Tx => {
                stats.tx_packets = counter.packets;
                stats.tx_bytes = counter.bytes;
                *found |= FOUND_TX;
            }
        }

        if filter.int_iface.is_some() && filter.ext_iface.is_some() && *found == FOUND_BOTH {
            return Ok(vec![stats.clone()]);
        }
    }

    if let Some((stats, _)) = pairs.iter().find(|(_, found)| *found != FOUND_BOTH) {
        return Err(ControllerError::StatsParse(format!(
            "unpaired counters for {} <-> {}",
            stats.int_iface, stats.ext_iface
        )));
    }
    if pairs.is_empty() && !saw_header && !filter.is_filtering() {
        return Err(ControllerError::StatsParse(
            "no tethering counters chain in listing".to_string(),
        ));
    }
    Ok(pairs.into_iter().map(|(s, _)| s).collect())
}

/// Lists `chain` for both IP versions and merges their per-pair counters.
pub fn get_tether_stats<B: RuleBackend + ?Sized>(
    backend: &mut B,
    chain: &str,
    filter: &TetherFilter,
) -> Result<Vec<TetherStats>> {
    let args = RuleDirective::list_counters(chain).args();
    let mut merged = Vec::new();
    for ip in IpVersion::BOTH {
        let output = backend.run(ip, &args, FailureLog::Show)?;
        for stats in parse_forward_chain_stats(&output, filter)? {
            merge_into(&mut merged, stats);
        }
    }
    Ok(merged)
}
