//! Folds counters reported by the hardware offload path back into the rule
//! table so its per-pair totals stay monotonic across accelerator resets.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs,
    ops::{Add, Sub},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use inotify::{EventMask, Inotify, WatchMask};
use log::{debug, error, info, warn};

use crate::{
    backend::{FailureLog, IpVersion, RuleBackend},
    error::{ControllerError, Result},
    rules::{Predicate, RuleDirective},
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PairCounters {
    pub rx_bytes: i64,
    pub rx_packets: i64,
    pub tx_bytes: i64,
    pub tx_packets: i64,
}

impl PairCounters {
    fn is_zero(&self) -> bool {
        *self == PairCounters::default()
    }

    /// Any counter below `earlier` means the source restarted from zero.
    fn went_backwards_from(&self, earlier: &PairCounters) -> bool {
        self.rx_bytes < earlier.rx_bytes
            || self.rx_packets < earlier.rx_packets
            || self.tx_bytes < earlier.tx_bytes
            || self.tx_packets < earlier.tx_packets
    }
}

impl Add for PairCounters {
    type Output = PairCounters;

    fn add(self, rhs: Self) -> Self {
        PairCounters {
            rx_bytes: self.rx_bytes + rhs.rx_bytes,
            rx_packets: self.rx_packets + rhs.rx_packets,
            tx_bytes: self.tx_bytes + rhs.tx_bytes,
            tx_packets: self.tx_packets + rhs.tx_packets,
        }
    }
}

impl Sub for PairCounters {
    type Output = PairCounters;

    fn sub(self, rhs: Self) -> Self {
        PairCounters {
            rx_bytes: self.rx_bytes - rhs.rx_bytes,
            rx_packets: self.rx_packets - rhs.rx_packets,
            tx_bytes: self.tx_bytes - rhs.tx_bytes,
            tx_packets: self.tx_packets - rhs.tx_packets,
        }
    }
}

/// One `iif oif rxB rxP txB txP` record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OffloadStats {
    pub iif: String,
    pub oif: String,
    pub counters: PairCounters,
}

impl OffloadStats {
    fn pair_name(&self) -> String {
        format!("{}_{}", self.iif, self.oif)
    }
}

/// Parses every well-formed record in `contents`; malformed lines are skipped.
pub fn parse_offload_stats(contents: &str) -> Vec<OffloadStats> {
    let mut records = Vec::new();
    for line in contents.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }
        let parsed = match tokens.as_slice() {
            [iif, oif, rx_b, rx_p, tx_b, tx_p] => (|| {
                Some(OffloadStats {
                    iif: iif.to_string(),
                    oif: oif.to_string(),
                    counters: PairCounters {
                        rx_bytes: rx_b.parse().ok()?,
                        rx_packets: rx_p.parse().ok()?,
                        tx_bytes: tx_b.parse().ok()?,
                        tx_packets: tx_p.parse().ok()?,
                    },
                })
            })(),
            _ => None,
        };
        match parsed {
            Some(record) => records.push(record),
            None => warn!("ignoring malformed offload stats line {line:?}"),
        }
    }
    records
}

/// Keeps, per `iif_oif` pair, the previous raw sample and the last corrected
/// snapshot.
#[derive(Debug)]
pub struct OffloadReconciler {
    chain: String,
    prev_sample: HashMap<String, PairCounters>,
    last_snapshot: HashMap<String, PairCounters>,
}

impl OffloadReconciler {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            prev_sample: HashMap::new(),
            last_snapshot: HashMap::new(),
        }
    }

    /// Forgets raw samples once an interface goes down; the corrected
    /// snapshots already carry their totals.
    pub fn clear_prev_stats(&mut self) {
        self.prev_sample.clear();
        debug!("offload previous samples cleared");
    }

    #[cfg(test)]
    pub fn last_snapshot(&self, iif: &str, oif: &str) -> Option<PairCounters> {
        self.last_snapshot.get(&format!("{iif}_{oif}")).copied()
    }

    /// `current - previous + last`, recording both the raw and corrected
    /// values. A raw sample below the previous one is an accelerator reset
    /// and counts from zero.
    pub fn correct(&mut self, current: &OffloadStats) -> OffloadStats {
        let pair = current.pair_name();
        let prev = match self.prev_sample.get(&pair) {
            Some(prev) if current.counters.went_backwards_from(prev) => {
                debug!("offload counters for {pair} restarted");
                PairCounters::default()
            }
            Some(prev) => *prev,
            None => PairCounters::default(),
        };
        let last = self.last_snapshot.get(&pair).copied().unwrap_or_default();
        let corrected = current.counters - prev + last;

        self.last_snapshot.insert(pair.clone(), corrected);
        self.prev_sample.insert(pair, current.counters);

        OffloadStats {
            iif: current.iif.clone(),
            oif: current.oif.clone(),
            counters: corrected,
        }
    }

    /// Applies one notification's worth of records and returns how many were
    /// pushed. All-zero records are ignored.
    pub fn reconcile<B: RuleBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        contents: &str,
    ) -> Result<usize> {
        let mut pushed = 0;
        for record in parse_offload_stats(contents) {
            if record.counters.is_zero() {
                continue;
            }
            let corrected = self.correct(&record);
            debug!(
                "offload {} -> {}: {:?}",
                corrected.iif, corrected.oif, corrected.counters
            );
            self.push_counters(backend, &corrected, pushed == 0)?;
            pushed += 1;
        }
        Ok(pushed)
    }

    fn push_counters<B: RuleBackend + ?Sized>(
        &self,
        backend: &mut B,
        stats: &OffloadStats,
        flush_first: bool,
    ) -> Result<()> {
        let c = &stats.counters;
        let mut directives = Vec::with_capacity(3);
        if flush_first {
            directives.push(RuleDirective::flush(self.chain.as_str()));
        }
        directives.push(
            RuleDirective::append(self.chain.as_str())
                .in_iface(&stats.iif)
                .out_iface(&stats.oif)
                .with(Predicate::SetCounters {
                    packets: c.tx_packets,
                    bytes: c.tx_bytes,
                })
                .short_jump("RETURN"),
        );
        directives.push(
            RuleDirective::append(self.chain.as_str())
                .in_iface(&stats.oif)
                .out_iface(&stats.iif)
                .with(Predicate::SetCounters {
                    packets: c.rx_packets,
                    bytes: c.rx_bytes,
                })
                .short_jump("RETURN"),
        );
        for directive in directives {
            backend.run(IpVersion::V4, &directive.args(), FailureLog::Show)?;
        }
        Ok(())
    }
}

/// Reconciler shared between the watcher thread and the command surface,
/// which clears raw samples when a tethered interface goes down.
#[derive(Clone, Debug)]
pub struct SharedReconciler(Arc<Mutex<OffloadReconciler>>);

impl SharedReconciler {
    pub fn new(reconciler: OffloadReconciler) -> Self {
        Self(Arc::new(Mutex::new(reconciler)))
    }

    /// A panic mid-update leaves the maps usable, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, OffloadReconciler> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Blocks on close-after-write events in `dir`, reconciling whenever
/// `file_name` is rewritten. Only returns on a watcher error.
pub fn watch_offload_stats<B: RuleBackend>(
    mut backend: B,
    reconciler: SharedReconciler,
    dir: &Path,
    file_name: &str,
) -> Result<()> {
    let mut inotify =
        Inotify::init().map_err(|e| ControllerError::io("failed to init inotify", e))?;
    inotify
        .watches()
        .add(dir, WatchMask::CLOSE_WRITE)
        .map_err(|e| ControllerError::io(format!("failed to watch {}", dir.display()), e))?;
    info!("watching {} for offload stats", dir.display());

    let stats_path: PathBuf = dir.join(file_name);
    let mut buffer = [0u8; 4096];
    loop {
        let events = inotify
            .read_events_blocking(&mut buffer)
            .map_err(|e| ControllerError::io("failed to read inotify events", e))?;
        for event in events {
            if !event.mask.contains(EventMask::CLOSE_WRITE) {
                continue;
            }
            if event.name != Some(OsStr::new(file_name)) {
                continue;
            }
            let contents = match fs::read_to_string(&stats_path) {
                Ok(c) => c,
                Err(e) => {
                    error!("failed to read {}: {e}", stats_path.display());
                    continue;
                }
            };
            if let Err(e) = reconciler.lock().reconcile(&mut backend, &contents) {
                error!("offload reconcile failed: {e}");
            }
        }
    }
}
