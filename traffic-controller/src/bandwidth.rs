//! Quota and alert orchestration on top of the `bw_*` iptables chains.
//!
//! Chain layout, for one costly interface `X` with its own quota:
//!
//! ```text
//! bw_INPUT   : [globalAlert] -i X -> bw_costly_X ... socket-exists
//! bw_costly_X: -> bw_penalty_box, quota2 X -> REJECT, [XAlert]
//! bw_penalty_box: naughty uids -> REJECT ... -> bw_happy_box
//! bw_happy_box  : nice uids, system uids -> RETURN ... -> bw_data_saver
//! ```
//!
//! Callers serialize access; the controller does no locking of its own.

use std::{collections::VecDeque, fs, path::PathBuf};

use log::{debug, error, info};

use traffic_controller_common::MAX_SYSTEM_UID;

use crate::{
    backend::{FailureLog, IpVersion, RuleBackend, restore_both, run_both},
    error::{ControllerError, Result},
    rules::{Predicate, RestoreBatch, RuleDirective, Table, is_iface_name},
    tether_stats::{self, TetherFilter, TetherStats},
};

pub const LOCAL_INPUT: &str = "bw_INPUT";
pub const LOCAL_OUTPUT: &str = "bw_OUTPUT";
pub const LOCAL_FORWARD: &str = "bw_FORWARD";
pub const LOCAL_RAW_PREROUTING: &str = "bw_raw_PREROUTING";
pub const LOCAL_MANGLE_POSTROUTING: &str = "bw_mangle_POSTROUTING";
pub const NAUGHTY_CHAIN: &str = "bw_penalty_box";
pub const NICE_CHAIN: &str = "bw_happy_box";
pub const DATA_SAVER_CHAIN: &str = "bw_data_saver";
pub const COSTLY_SHARED_CHAIN: &str = "bw_costly_shared";

const COSTLY_PREFIX: &str = "bw_costly_";
const ALERT_GLOBAL_NAME: &str = "globalAlert";
const SHARED_COST_NAME: &str = "shared";
const REJECT: &str = "REJECT";
const RETURN: &str = "RETURN";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QuotaInfo {
    pub iface: String,
    pub quota: i64,
    /// 0 when no alert is set.
    pub alert: i64,
}

/// Userspace view of what is installed. Byte values of 0 mean "unset".
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OrchestratorState {
    /// Most recently added first.
    pub shared_quota_ifaces: VecDeque<String>,
    pub shared_quota_bytes: i64,
    pub shared_alert_bytes: i64,
    /// Most recently added first.
    pub quota_ifaces: VecDeque<QuotaInfo>,
    pub global_alert_bytes: i64,
    pub global_alert_tether_count: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum QuotaType {
    Unique,
    Shared,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SpecialAppOp {
    Insert,
    Delete,
}

pub struct BandwidthController<B: RuleBackend> {
    backend: B,
    state: OrchestratorState,
    quota_dir: PathBuf,
}

fn keep_first(slot: &mut Option<ControllerError>, result: Result<()>) {
    if let Err(err) = result {
        slot.get_or_insert(err);
    }
}

fn costly_chain(cost_name: &str) -> String {
    format!("{COSTLY_PREFIX}{cost_name}")
}

fn check_iface(iface: &str) -> Result<()> {
    if is_iface_name(iface) {
        Ok(())
    } else {
        Err(ControllerError::InvalidArgument(format!(
            "invalid interface name {iface:?}"
        )))
    }
}

/// Quota values accept 1..=i64::MAX; -1 is passed through as "remove".
fn check_quota(bytes: i64) -> Result<()> {
    if bytes == 0 || bytes < -1 {
        error!("invalid bytes value {bytes}, expected 1..max_int64");
        return Err(ControllerError::InvalidQuotaValue(bytes));
    }
    Ok(())
}

fn check_alert(bytes: i64) -> Result<()> {
    if bytes <= 0 {
        error!("invalid alert bytes value {bytes}, expected 1..max_int64");
        return Err(ControllerError::InvalidQuotaValue(bytes));
    }
    Ok(())
}

fn quota_rule(base: RuleDirective, cost_name: &str, bytes: i64) -> RuleDirective {
    base.with(Predicate::Quota2 {
        bytes,
        name: cost_name.to_string(),
    })
    .jump(REJECT)
}

fn alert_rule(base: RuleDirective, alert_name: &str, bytes: i64) -> RuleDirective {
    base.with(Predicate::Quota2 {
        bytes,
        name: alert_name.to_string(),
    })
}

/// Resets every fixed chain in all three tables.
pub fn flush_batch() -> RestoreBatch {
    RestoreBatch::filter(
        [
            LOCAL_INPUT,
            LOCAL_OUTPUT,
            LOCAL_FORWARD,
            NICE_CHAIN,
            NAUGHTY_CHAIN,
            DATA_SAVER_CHAIN,
            COSTLY_SHARED_CHAIN,
        ]
        .into_iter()
        .map(RuleDirective::reset_chain)
        .collect(),
    )
    .table(
        Table::Raw,
        vec![RuleDirective::reset_chain(LOCAL_RAW_PREROUTING)],
    )
    .table(
        Table::Mangle,
        vec![RuleDirective::reset_chain(LOCAL_MANGLE_POSTROUTING)],
    )
}

/// Tracking rules plus the fixed penalty -> happy -> data saver jump order.
pub fn basic_accounting_batch() -> RestoreBatch {
    RestoreBatch::filter(vec![
        RuleDirective::append(LOCAL_INPUT).with(Predicate::SocketExists),
        RuleDirective::append(LOCAL_OUTPUT).with(Predicate::SocketExists),
        RuleDirective::append(COSTLY_SHARED_CHAIN).jump(NAUGHTY_CHAIN),
        RuleDirective::append(NAUGHTY_CHAIN).jump(NICE_CHAIN),
        RuleDirective::append(NICE_CHAIN).jump(DATA_SAVER_CHAIN),
        RuleDirective::append(DATA_SAVER_CHAIN).short_jump(RETURN),
        RuleDirective::insert(NICE_CHAIN)
            .with(Predicate::UidOwner(format!("0-{MAX_SYSTEM_UID}")))
            .jump(RETURN),
    ])
    .table(
        Table::Raw,
        vec![RuleDirective::append(LOCAL_RAW_PREROUTING).with(Predicate::SocketExists)],
    )
    .table(
        Table::Mangle,
        vec![RuleDirective::append(LOCAL_MANGLE_POSTROUTING).with(Predicate::SocketExists)],
    )
}

/// Builds the batch resetting (and with `remove`, deleting) every per-interface
/// costly chain found in a `-S` listing. `bw_costly_shared` is left alone.
pub fn costly_flush_batch(rule_list: &str, remove: bool) -> Option<RestoreBatch> {
    let mut directives = Vec::new();
    for line in rule_list.lines() {
        let Some(chain) = line.strip_prefix("-N ") else {
            continue;
        };
        if !chain.starts_with(COSTLY_PREFIX) || chain == COSTLY_SHARED_CHAIN {
            continue;
        }
        directives.push(RuleDirective::reset_chain(chain));
        if remove {
            directives.push(RuleDirective::delete_chain(chain));
        }
    }
    (!directives.is_empty()).then(|| RestoreBatch::filter(directives))
}

impl<B: RuleBackend> BandwidthController<B> {
    pub fn new(backend: B, quota_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            state: OrchestratorState::default(),
            quota_dir: quota_dir.into(),
        }
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    #[cfg(test)]
    pub(crate) fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Per-pair forwarding counters from `chain`, merged across v4 and v6.
    pub fn get_tether_stats(
        &mut self,
        chain: &str,
        filter: &TetherFilter,
    ) -> Result<Vec<TetherStats>> {
        tether_stats::get_tether_stats(&mut self.backend, chain, filter)
    }

    /// Clears leftovers from a previous run. Failures are ignored.
    pub fn setup_iptables_hooks(&mut self) -> Result<()> {
        self.flush_clean_tables(true);
        Ok(())
    }

    pub fn enable_bandwidth_control(&mut self) -> Result<()> {
        self.state = OrchestratorState::default();
        self.flush_clean_tables(false);
        restore_both(&mut self.backend, &basic_accounting_batch())?;
        info!("bandwidth control enabled");
        Ok(())
    }

    pub fn disable_bandwidth_control(&mut self) -> Result<()> {
        self.flush_clean_tables(false);
        info!("bandwidth control disabled");
        Ok(())
    }

    fn flush_clean_tables(&mut self, clean: bool) {
        self.flush_existing_costly_tables(clean);
        if let Err(err) = restore_both(&mut self.backend, &flush_batch()) {
            debug!("flushing bandwidth chains failed: {err}");
        }
    }

    fn flush_existing_costly_tables(&mut self, clean: bool) {
        let list = RestoreBatch::filter(vec![RuleDirective::list_rules()]).to_string();
        // v6 carries the same chains, so only v4 is listed.
        let rules = match self.backend.restore(IpVersion::V4, &list) {
            Ok(rules) => rules,
            Err(err) => {
                error!("failed to list existing costly tables: {err}");
                return;
            }
        };
        if let Some(batch) = costly_flush_batch(&rules, clean) {
            if let Err(err) = restore_both(&mut self.backend, &batch) {
                debug!("flushing costly chains failed: {err}");
            }
        }
    }

    pub fn enable_data_saver(&mut self, enable: bool) -> Result<()> {
        let target = if enable { REJECT } else { RETURN };
        restore_both(
            &mut self.backend,
            &RestoreBatch::filter(vec![RuleDirective::replace(DATA_SAVER_CHAIN, 1).jump(target)]),
        )
    }

    pub fn add_naughty_apps(&mut self, uids: &[&str]) -> Result<()> {
        self.manipulate_special_apps(uids, NAUGHTY_CHAIN, REJECT, SpecialAppOp::Insert)
    }

    pub fn remove_naughty_apps(&mut self, uids: &[&str]) -> Result<()> {
        self.manipulate_special_apps(uids, NAUGHTY_CHAIN, REJECT, SpecialAppOp::Delete)
    }

    pub fn add_nice_apps(&mut self, uids: &[&str]) -> Result<()> {
        self.manipulate_special_apps(uids, NICE_CHAIN, RETURN, SpecialAppOp::Insert)
    }

    pub fn remove_nice_apps(&mut self, uids: &[&str]) -> Result<()> {
        self.manipulate_special_apps(uids, NICE_CHAIN, RETURN, SpecialAppOp::Delete)
    }

    /// Every uid is parsed before anything is applied. A uid that then fails
    /// has its own rule rolled back; uids applied before it stay applied.
    fn manipulate_special_apps(
        &mut self,
        uids: &[&str],
        chain: &str,
        target: &str,
        op: SpecialAppOp,
    ) -> Result<()> {
        let parsed = uids
            .iter()
            .map(|s| {
                s.parse::<u32>()
                    .map_err(|_| ControllerError::InvalidArgument(format!("invalid uid {s:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        for uid in parsed {
            let rule = |base: RuleDirective| {
                base.with(Predicate::UidOwner(uid.to_string()))
                    .jump(target)
            };
            let directive = match op {
                SpecialAppOp::Insert => rule(RuleDirective::insert(chain)),
                SpecialAppOp::Delete => rule(RuleDirective::delete(chain)),
            };
            if let Err(err) = run_both(&mut self.backend, &directive, FailureLog::Show) {
                error!("failed to update {chain} for uid {uid}: {err}");
                if op == SpecialAppOp::Insert {
                    let _ = run_both(
                        &mut self.backend,
                        &rule(RuleDirective::delete(chain)),
                        FailureLog::Hide,
                    );
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Hooks `iface` into the input/output/forward chains, behind the global
    /// alert when one is installed.
    fn prep_costly_iface(&mut self, iface: &str, quota_type: QuotaType) -> Result<()> {
        let mut first_err = None;
        let chain = match quota_type {
            QuotaType::Unique => {
                let chain = costly_chain(iface);
                // Exactly one of flush/create succeeds depending on whether
                // the chain survived a restart.
                let flushed = run_both(
                    &mut self.backend,
                    &RuleDirective::flush(&chain),
                    FailureLog::Hide,
                )
                .is_ok();
                let created = run_both(
                    &mut self.backend,
                    &RuleDirective::new_chain(&chain),
                    FailureLog::Hide,
                )
                .is_ok();
                if flushed == created {
                    first_err.get_or_insert(ControllerError::BackendCommandFailed {
                        command: format!("-F/-N {chain}"),
                        status: "could not prepare chain".to_string(),
                    });
                }
                keep_first(
                    &mut first_err,
                    run_both(
                        &mut self.backend,
                        &RuleDirective::append(&chain).short_jump(NAUGHTY_CHAIN),
                        FailureLog::Show,
                    ),
                );
                chain
            }
            QuotaType::Shared => COSTLY_SHARED_CHAIN.to_string(),
        };

        let pos = if self.state.global_alert_bytes != 0 { 2 } else { 1 };

        let hooks = [
            (
                RuleDirective::delete(LOCAL_INPUT).in_iface(iface),
                RuleDirective::insert_at(LOCAL_INPUT, pos).in_iface(iface),
            ),
            (
                RuleDirective::delete(LOCAL_OUTPUT).out_iface(iface),
                RuleDirective::insert_at(LOCAL_OUTPUT, pos).out_iface(iface),
            ),
            (
                RuleDirective::delete(LOCAL_FORWARD).out_iface(iface),
                RuleDirective::append(LOCAL_FORWARD).out_iface(iface),
            ),
        ];
        for (stale, hook) in hooks {
            let _ = run_both(&mut self.backend, &stale.jump(&chain), FailureLog::Hide);
            keep_first(
                &mut first_err,
                run_both(&mut self.backend, &hook.jump(&chain), FailureLog::Show),
            );
        }

        first_err.map_or(Ok(()), Err)
    }

    fn cleanup_costly_iface(
        &mut self,
        iface: &str,
        quota_type: QuotaType,
        log: FailureLog,
    ) -> Result<()> {
        let chain = match quota_type {
            QuotaType::Unique => costly_chain(iface),
            QuotaType::Shared => COSTLY_SHARED_CHAIN.to_string(),
        };
        let mut directives = vec![
            RuleDirective::delete(LOCAL_INPUT).in_iface(iface).jump(&chain),
            RuleDirective::delete(LOCAL_OUTPUT).out_iface(iface).jump(&chain),
            RuleDirective::delete(LOCAL_FORWARD).out_iface(iface).jump(&chain),
        ];
        if quota_type == QuotaType::Unique {
            directives.push(RuleDirective::flush(&chain));
            directives.push(RuleDirective::delete_chain(&chain));
        }

        let mut first_err = None;
        for directive in directives {
            keep_first(&mut first_err, run_both(&mut self.backend, &directive, log));
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn set_interface_shared_quota(&mut self, iface: &str, max_bytes: i64) -> Result<()> {
        check_iface(iface)?;
        check_quota(max_bytes)?;
        if max_bytes == -1 {
            return self.remove_interface_shared_quota(iface);
        }

        if !self.state.shared_quota_ifaces.iter().any(|i| i == iface) {
            if let Err(err) = self.add_shared_quota_iface(iface, max_bytes) {
                error!("failed to set shared quota on {iface}: {err}");
                let _ = self.cleanup_costly_iface(iface, QuotaType::Shared, FailureLog::Hide);
                if self.state.shared_quota_ifaces.is_empty() {
                    let _ = run_both(
                        &mut self.backend,
                        &quota_rule(
                            RuleDirective::delete(COSTLY_SHARED_CHAIN),
                            SHARED_COST_NAME,
                            max_bytes,
                        ),
                        FailureLog::Hide,
                    );
                    self.state.shared_quota_bytes = 0;
                }
                return Err(err);
            }
        }

        if max_bytes != self.state.shared_quota_bytes {
            if let Err(err) = self.update_quota(SHARED_COST_NAME, max_bytes) {
                error!("failed to update shared quota: {err}");
                let _ = self.remove_interface_shared_quota(iface);
                return Err(err);
            }
            self.state.shared_quota_bytes = max_bytes;
        }
        Ok(())
    }

    fn add_shared_quota_iface(&mut self, iface: &str, max_bytes: i64) -> Result<()> {
        self.prep_costly_iface(iface, QuotaType::Shared)?;
        if self.state.shared_quota_ifaces.is_empty() {
            run_both(
                &mut self.backend,
                &quota_rule(
                    RuleDirective::insert(COSTLY_SHARED_CHAIN),
                    SHARED_COST_NAME,
                    max_bytes,
                ),
                FailureLog::Show,
            )?;
            self.state.shared_quota_bytes = max_bytes;
        }
        self.state.shared_quota_ifaces.push_front(iface.to_string());
        Ok(())
    }

    /// Also drops the shared quota rule and shared alert once the last
    /// interface is gone.
    pub fn remove_interface_shared_quota(&mut self, iface: &str) -> Result<()> {
        check_iface(iface)?;
        let Some(idx) = self.state.shared_quota_ifaces.iter().position(|i| i == iface) else {
            error!("no such iface {iface} to delete");
            return Err(ControllerError::NotInState(format!("shared quota on {iface}")));
        };

        let mut first_err = None;
        keep_first(
            &mut first_err,
            self.cleanup_costly_iface(iface, QuotaType::Shared, FailureLog::Show),
        );
        self.state.shared_quota_ifaces.remove(idx);

        if self.state.shared_quota_ifaces.is_empty() {
            keep_first(
                &mut first_err,
                run_both(
                    &mut self.backend,
                    &quota_rule(
                        RuleDirective::delete(COSTLY_SHARED_CHAIN),
                        SHARED_COST_NAME,
                        self.state.shared_quota_bytes,
                    ),
                    FailureLog::Show,
                ),
            );
            self.state.shared_quota_bytes = 0;
            if self.state.shared_alert_bytes != 0 {
                keep_first(&mut first_err, self.remove_shared_alert());
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn set_interface_quota(&mut self, iface: &str, max_bytes: i64) -> Result<()> {
        check_iface(iface)?;
        check_quota(max_bytes)?;
        if max_bytes == -1 {
            return self.remove_interface_quota(iface);
        }

        if let Some(idx) = self.state.quota_ifaces.iter().position(|q| q.iface == iface) {
            if let Err(err) = self.update_quota(iface, max_bytes) {
                error!("failed to update quota for {iface}: {err}");
                let _ = self.remove_interface_quota(iface);
                return Err(err);
            }
            self.state.quota_ifaces[idx].quota = max_bytes;
            return Ok(());
        }

        // The quota goes after the penalty box jump so naughty apps cannot
        // drain it.
        let installed = self.prep_costly_iface(iface, QuotaType::Unique).and_then(|()| {
            run_both(
                &mut self.backend,
                &quota_rule(RuleDirective::append(costly_chain(iface)), iface, max_bytes),
                FailureLog::Show,
            )
        });
        if let Err(err) = installed {
            error!("failed to set quota rule on {iface}: {err}");
            let _ = self.cleanup_costly_iface(iface, QuotaType::Unique, FailureLog::Hide);
            return Err(err);
        }

        self.state.quota_ifaces.push_front(QuotaInfo {
            iface: iface.to_string(),
            quota: max_bytes,
            alert: 0,
        });
        Ok(())
    }

    pub fn remove_interface_quota(&mut self, iface: &str) -> Result<()> {
        check_iface(iface)?;
        let Some(idx) = self.state.quota_ifaces.iter().position(|q| q.iface == iface) else {
            error!("no such iface {iface} to delete");
            return Err(ControllerError::NotInState(format!("quota on {iface}")));
        };
        // Deleting the chain also removes its quota and alert rules.
        let res = self.cleanup_costly_iface(iface, QuotaType::Unique, FailureLog::Show);
        self.state.quota_ifaces.remove(idx);
        res
    }

    pub fn get_interface_shared_quota(&self) -> Result<i64> {
        self.get_interface_quota(SHARED_COST_NAME)
    }

    /// Remaining bytes of a named quota, read from its live counter file.
    pub fn get_interface_quota(&self, name: &str) -> Result<i64> {
        check_iface(name)?;
        let path = self.quota_dir.join(name);
        let contents = fs::read_to_string(&path).map_err(|e| {
            error!("reading quota {name} failed: {e}");
            ControllerError::io(format!("failed to read {}", path.display()), e)
        })?;
        contents
            .split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                ControllerError::StatsParse(format!("bad quota value in {}", path.display()))
            })
    }

    fn update_quota(&self, name: &str, bytes: i64) -> Result<()> {
        if !is_iface_name(name) {
            error!("update_quota: invalid quota name {name:?}");
            return Err(ControllerError::InvalidArgument(format!(
                "invalid quota name {name:?}"
            )));
        }
        let path = self.quota_dir.join(name);
        fs::write(&path, format!("{bytes}\n"))
            .map_err(|e| ControllerError::io(format!("failed to update {}", path.display()), e))
    }

    fn global_alert_batch(insert: bool, chains: &[&str], bytes: i64) -> RestoreBatch {
        RestoreBatch::filter(
            chains
                .iter()
                .map(|chain| {
                    let base = if insert {
                        RuleDirective::insert(*chain)
                    } else {
                        RuleDirective::delete(*chain)
                    };
                    alert_rule(base, ALERT_GLOBAL_NAME, bytes)
                })
                .collect(),
        )
    }

    pub fn set_global_alert(&mut self, bytes: i64) -> Result<()> {
        check_alert(bytes)?;
        if self.state.global_alert_bytes != 0 {
            self.update_quota(ALERT_GLOBAL_NAME, bytes)?;
            self.state.global_alert_bytes = bytes;
            return Ok(());
        }

        let forward = self.state.global_alert_tether_count > 0;
        let mut installed = restore_both(
            &mut self.backend,
            &Self::global_alert_batch(true, &[LOCAL_INPUT, LOCAL_OUTPUT], bytes),
        );
        if installed.is_ok() && forward {
            installed = restore_both(
                &mut self.backend,
                &Self::global_alert_batch(true, &[LOCAL_FORWARD], bytes),
            );
        }
        if let Err(err) = installed {
            error!("failed to install global alert: {err}");
            let mut chains = vec![LOCAL_INPUT, LOCAL_OUTPUT];
            if forward {
                chains.push(LOCAL_FORWARD);
            }
            for chain in chains {
                let batch = Self::global_alert_batch(false, &[chain], bytes).to_string();
                for ip in IpVersion::BOTH {
                    let _ = self.backend.restore(ip, &batch);
                }
            }
            return Err(err);
        }
        self.state.global_alert_bytes = bytes;
        Ok(())
    }

    pub fn remove_global_alert(&mut self) -> Result<()> {
        let bytes = self.state.global_alert_bytes;
        if bytes == 0 {
            error!("no prior global alert set");
            return Err(ControllerError::NoAlertConfigured(ALERT_GLOBAL_NAME.to_string()));
        }
        let mut first_err = None;
        keep_first(
            &mut first_err,
            restore_both(
                &mut self.backend,
                &Self::global_alert_batch(false, &[LOCAL_INPUT, LOCAL_OUTPUT], bytes),
            ),
        );
        if self.state.global_alert_tether_count > 0 {
            keep_first(
                &mut first_err,
                restore_both(
                    &mut self.backend,
                    &Self::global_alert_batch(false, &[LOCAL_FORWARD], bytes),
                ),
            );
        }
        self.state.global_alert_bytes = 0;
        first_err.map_or(Ok(()), Err)
    }

    /// Counts one more forwarding path. The forward-chain alert is installed
    /// only by the first one.
    pub fn set_global_alert_in_forward_chain(&mut self) -> Result<()> {
        self.state.global_alert_tether_count += 1;
        debug!(
            "global alert tether count now {}",
            self.state.global_alert_tether_count
        );
        if self.state.global_alert_bytes == 0 || self.state.global_alert_tether_count != 1 {
            return Ok(());
        }
        restore_both(
            &mut self.backend,
            &Self::global_alert_batch(true, &[LOCAL_FORWARD], self.state.global_alert_bytes),
        )
    }

    pub fn remove_global_alert_in_forward_chain(&mut self) -> Result<()> {
        if self.state.global_alert_tether_count == 0 {
            error!("no prior forward-chain alert set");
            return Err(ControllerError::NotInState("global alert tether count".to_string()));
        }
        self.state.global_alert_tether_count -= 1;
        if self.state.global_alert_bytes == 0 || self.state.global_alert_tether_count >= 1 {
            return Ok(());
        }
        restore_both(
            &mut self.backend,
            &Self::global_alert_batch(false, &[LOCAL_FORWARD], self.state.global_alert_bytes),
        )
    }

    pub fn set_shared_alert(&mut self, bytes: i64) -> Result<()> {
        if self.state.shared_quota_bytes == 0 {
            error!("need a prior shared quota to set an alert");
            return Err(ControllerError::NotInState("shared quota".to_string()));
        }
        check_alert(bytes)?;
        self.set_costly_alert(SHARED_COST_NAME, bytes, self.state.shared_alert_bytes)?;
        self.state.shared_alert_bytes = bytes;
        Ok(())
    }

    pub fn remove_shared_alert(&mut self) -> Result<()> {
        let res = self.remove_costly_alert(SHARED_COST_NAME, self.state.shared_alert_bytes);
        if !matches!(res, Err(ControllerError::NoAlertConfigured(_))) {
            self.state.shared_alert_bytes = 0;
        }
        res
    }

    pub fn set_interface_alert(&mut self, iface: &str, bytes: i64) -> Result<()> {
        check_iface(iface)?;
        check_alert(bytes)?;
        let Some(idx) = self.state.quota_ifaces.iter().position(|q| q.iface == iface) else {
            error!("need a prior interface quota on {iface} to set an alert");
            return Err(ControllerError::NotInState(format!("quota on {iface}")));
        };
        let current = self.state.quota_ifaces[idx].alert;
        self.set_costly_alert(iface, bytes, current)?;
        self.state.quota_ifaces[idx].alert = bytes;
        Ok(())
    }

    pub fn remove_interface_alert(&mut self, iface: &str) -> Result<()> {
        check_iface(iface)?;
        let Some(idx) = self.state.quota_ifaces.iter().position(|q| q.iface == iface) else {
            error!("no prior alert set for interface {iface}");
            return Err(ControllerError::NoAlertConfigured(iface.to_string()));
        };
        let res = self.remove_costly_alert(iface, self.state.quota_ifaces[idx].alert);
        if !matches!(res, Err(ControllerError::NoAlertConfigured(_))) {
            self.state.quota_ifaces[idx].alert = 0;
        }
        res
    }

    /// Appends `<cost>Alert` to the cost's chain, or rewrites its live value
    /// when `current` shows one is installed.
    fn set_costly_alert(&mut self, cost_name: &str, bytes: i64, current: i64) -> Result<()> {
        check_iface(cost_name)?;
        let alert_name = format!("{cost_name}Alert");
        if current != 0 {
            return self.update_quota(&alert_name, bytes);
        }
        run_both(
            &mut self.backend,
            &alert_rule(RuleDirective::append(costly_chain(cost_name)), &alert_name, bytes),
            FailureLog::Show,
        )
    }

    fn remove_costly_alert(&mut self, cost_name: &str, current: i64) -> Result<()> {
        check_iface(cost_name)?;
        if current == 0 {
            error!("no prior alert set for {cost_name}");
            return Err(ControllerError::NoAlertConfigured(cost_name.to_string()));
        }
        let alert_name = format!("{cost_name}Alert");
        run_both(
            &mut self.backend,
            &alert_rule(RuleDirective::delete(costly_chain(cost_name)), &alert_name, current),
            FailureLog::Show,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;

    const V4: IpVersion = IpVersion::V4;

    fn enabled() -> (BandwidthController<RecordingBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut bw = BandwidthController::new(RecordingBackend::new(), dir.path());
        bw.enable_bandwidth_control().unwrap();
        (bw, dir)
    }

    fn rules(bw: &BandwidthController<RecordingBackend>, chain: &str) -> Vec<String> {
        bw.backend.rules(V4, chain).unwrap_or_default()
    }

    #[test]
    fn fixed_batches_render_exactly() {
        assert_eq!(
            flush_batch().to_string(),
            "*filter\n:bw_INPUT -\n:bw_OUTPUT -\n:bw_FORWARD -\n:bw_happy_box -\n\
             :bw_penalty_box -\n:bw_data_saver -\n:bw_costly_shared -\nCOMMIT\n\
             *raw\n:bw_raw_PREROUTING -\nCOMMIT\n*mangle\n:bw_mangle_POSTROUTING -\nCOMMIT\n"
        );
        assert_eq!(
            basic_accounting_batch().to_string(),
            "*filter\n-A bw_INPUT -m owner --socket-exists\n\
             -A bw_OUTPUT -m owner --socket-exists\n\
             -A bw_costly_shared --jump bw_penalty_box\n\
             -A bw_penalty_box --jump bw_happy_box\n\
             -A bw_happy_box --jump bw_data_saver\n\
             -A bw_data_saver -j RETURN\n\
             -I bw_happy_box -m owner --uid-owner 0-9999 --jump RETURN\nCOMMIT\n\
             *raw\n-A bw_raw_PREROUTING -m owner --socket-exists\nCOMMIT\n\
             *mangle\n-A bw_mangle_POSTROUTING -m owner --socket-exists\nCOMMIT\n"
        );
    }

    #[test]
    fn costly_chain_listing_is_parsed() {
        let listing = "-P OUTPUT ACCEPT\n-N bw_costly_rmnet_data0\n-N bw_costly_shared\n\
                       -N bw_happy_box\n-A bw_INPUT -i rmnet_data0 --jump bw_costly_rmnet_data0\n\
                       -N bw_costly_rmnet_data7\n";
        assert_eq!(
            costly_flush_batch(listing, true).unwrap().to_string(),
            "*filter\n:bw_costly_rmnet_data0 -\n-X bw_costly_rmnet_data0\n\
             :bw_costly_rmnet_data7 -\n-X bw_costly_rmnet_data7\nCOMMIT\n"
        );
        assert_eq!(
            costly_flush_batch(listing, false).unwrap().to_string(),
            "*filter\n:bw_costly_rmnet_data0 -\n:bw_costly_rmnet_data7 -\nCOMMIT\n"
        );
        assert!(costly_flush_batch("-N bw_costly_shared\n-N bw_INPUT\n", true).is_none());
    }

    #[test]
    fn setup_hooks_removes_leftover_costly_chains() {
        let (mut bw, _dir) = enabled();
        bw.set_interface_quota("rmnet0", 1000).unwrap();
        assert!(bw.backend.has_chain(V4, "bw_costly_rmnet0"));

        bw.setup_iptables_hooks().unwrap();
        assert!(!bw.backend.has_chain(V4, "bw_costly_rmnet0"));
        assert!(bw.backend.has_chain(IpVersion::V6, "bw_costly_shared"));
        assert_eq!(rules(&bw, LOCAL_INPUT), Vec::<String>::new());
    }

    #[test]
    fn unique_quota_round_trip_restores_chains() {
        let (mut bw, _dir) = enabled();
        let before = bw.backend.filter_state(V4);

        bw.set_interface_quota("rmnet0", 500000).unwrap();
        assert_eq!(
            rules(&bw, "bw_costly_rmnet0"),
            vec![
                "-j bw_penalty_box",
                "-m quota2 ! --quota 500000 --name rmnet0 --jump REJECT"
            ]
        );
        assert_eq!(rules(&bw, LOCAL_INPUT)[0], "-i rmnet0 --jump bw_costly_rmnet0");
        assert_eq!(rules(&bw, LOCAL_OUTPUT)[0], "-o rmnet0 --jump bw_costly_rmnet0");
        assert_eq!(
            rules(&bw, LOCAL_FORWARD),
            vec!["-o rmnet0 --jump bw_costly_rmnet0"]
        );
        assert_eq!(bw.state().quota_ifaces.len(), 1);

        bw.remove_interface_quota("rmnet0").unwrap();
        assert_eq!(bw.backend.filter_state(V4), before);
        assert_eq!(bw.backend.filter_state(IpVersion::V6), before);
        assert!(bw.state().quota_ifaces.is_empty());
    }

    #[test]
    fn repeated_quota_updates_live_value_only() {
        let (mut bw, dir) = enabled();
        bw.set_interface_quota("wlan0", 500000).unwrap();
        let installed = bw.backend.filter_state(V4);
        let commands = bw.backend.commands.len();

        bw.set_interface_quota("wlan0", 500000).unwrap();
        bw.set_interface_quota("wlan0", 700000).unwrap();
        assert_eq!(bw.backend.commands.len(), commands);
        assert_eq!(bw.backend.filter_state(V4), installed);
        assert_eq!(
            fs::read_to_string(dir.path().join("wlan0")).unwrap(),
            "700000\n"
        );
        assert_eq!(bw.state().quota_ifaces[0].quota, 700000);
        assert_eq!(bw.get_interface_quota("wlan0").unwrap(), 700000);
    }

    #[test]
    fn invalid_quota_requests_have_no_side_effects() {
        let (mut bw, _dir) = enabled();
        let commands = bw.backend.commands.len();
        assert!(matches!(
            bw.set_interface_quota("rmnet0", 0),
            Err(ControllerError::InvalidQuotaValue(0))
        ));
        assert!(matches!(
            bw.set_interface_shared_quota("rmnet0", -5),
            Err(ControllerError::InvalidQuotaValue(-5))
        ));
        assert!(matches!(
            bw.set_interface_quota("rmnet0;reboot", 10),
            Err(ControllerError::InvalidArgument(_))
        ));
        assert!(matches!(
            bw.remove_interface_quota("rmnet0"),
            Err(ControllerError::NotInState(_))
        ));
        assert!(matches!(
            bw.set_interface_quota("rmnet0", -1),
            Err(ControllerError::NotInState(_))
        ));
        assert_eq!(bw.backend.commands.len(), commands);
    }

    #[test]
    fn failed_install_rolls_back() {
        let (mut bw, _dir) = enabled();
        let before = bw.backend.filter_state(V4);
        bw.backend.fail_on("v6 -A bw_costly_rmnet0 -m quota2");

        let err = bw.set_interface_quota("rmnet0", 4096).unwrap_err();
        assert!(matches!(err, ControllerError::BackendCommandFailed { .. }));
        assert!(bw.state().quota_ifaces.is_empty());
        assert_eq!(bw.backend.filter_state(V4), before);
        assert!(!bw.backend.has_chain(IpVersion::V6, "bw_costly_rmnet0"));
    }

    #[test]
    fn shared_quota_rule_lives_while_any_iface_does() {
        let (mut bw, _dir) = enabled();
        let quota_rule = "-m quota2 ! --quota 1000000 --name shared --jump REJECT";

        bw.set_interface_shared_quota("wlan0", 1000000).unwrap();
        bw.set_interface_shared_quota("rmnet0", 1000000).unwrap();
        let shared = rules(&bw, COSTLY_SHARED_CHAIN);
        assert_eq!(shared.iter().filter(|r| *r == quota_rule).count(), 1);
        assert_eq!(shared[0], quota_rule);
        let input = rules(&bw, LOCAL_INPUT);
        assert!(input.contains(&"-i wlan0 --jump bw_costly_shared".to_string()));
        assert!(input.contains(&"-i rmnet0 --jump bw_costly_shared".to_string()));
        assert_eq!(bw.state().shared_quota_ifaces, ["rmnet0", "wlan0"]);

        bw.remove_interface_shared_quota("wlan0").unwrap();
        assert!(rules(&bw, COSTLY_SHARED_CHAIN).contains(&quota_rule.to_string()));
        assert!(!rules(&bw, LOCAL_INPUT).contains(&"-i wlan0 --jump bw_costly_shared".to_string()));

        bw.remove_interface_shared_quota("rmnet0").unwrap();
        assert_eq!(rules(&bw, COSTLY_SHARED_CHAIN), vec!["--jump bw_penalty_box"]);
        assert_eq!(bw.state().shared_quota_bytes, 0);
        assert!(matches!(
            bw.remove_interface_shared_quota("rmnet0"),
            Err(ControllerError::NotInState(_))
        ));
    }

    #[test]
    fn last_shared_iface_takes_the_shared_alert_with_it() {
        let (mut bw, _dir) = enabled();
        assert!(matches!(
            bw.set_shared_alert(10),
            Err(ControllerError::NotInState(_))
        ));
        bw.set_interface_shared_quota("wlan0", 5000).unwrap();
        bw.set_shared_alert(100).unwrap();
        assert!(rules(&bw, COSTLY_SHARED_CHAIN)
            .contains(&"-m quota2 ! --quota 100 --name sharedAlert".to_string()));

        bw.remove_interface_shared_quota("wlan0").unwrap();
        assert_eq!(bw.state().shared_alert_bytes, 0);
        assert_eq!(rules(&bw, COSTLY_SHARED_CHAIN), vec!["--jump bw_penalty_box"]);
    }

    #[test]
    fn naughty_apps_add_and_remove() {
        let (mut bw, _dir) = enabled();
        bw.add_naughty_apps(&["1000", "1001"]).unwrap();
        bw.remove_naughty_apps(&["1000"]).unwrap();
        assert_eq!(
            rules(&bw, NAUGHTY_CHAIN),
            vec!["-m owner --uid-owner 1001 --jump REJECT", "--jump bw_happy_box"]
        );

        bw.add_nice_apps(&["10050"]).unwrap();
        assert_eq!(
            rules(&bw, NICE_CHAIN)[0],
            "-m owner --uid-owner 10050 --jump RETURN"
        );
    }

    #[test]
    fn malformed_uid_rejects_whole_batch() {
        let (mut bw, _dir) = enabled();
        let commands = bw.backend.commands.len();
        assert!(matches!(
            bw.add_naughty_apps(&["1000", "app_3"]),
            Err(ControllerError::InvalidArgument(_))
        ));
        assert_eq!(bw.backend.commands.len(), commands);
    }

    #[test]
    fn special_app_failure_rolls_back_only_the_failing_uid() {
        let (mut bw, _dir) = enabled();
        bw.backend.fail_on("v6 -I bw_penalty_box -m owner --uid-owner 1001");

        assert!(bw.add_naughty_apps(&["1000", "1001", "1002"]).is_err());
        // 1000 stays applied; 1001 is rolled back on v4; 1002 is never tried.
        assert_eq!(
            rules(&bw, NAUGHTY_CHAIN),
            vec!["-m owner --uid-owner 1000 --jump REJECT", "--jump bw_happy_box"]
        );
        assert!(!bw.backend.commands.iter().any(|c| c.contains("1002")));
    }

    #[test]
    fn forward_alert_follows_tether_count() {
        let (mut bw, _dir) = enabled();
        bw.set_global_alert_in_forward_chain().unwrap();
        bw.set_global_alert_in_forward_chain().unwrap();
        assert!(rules(&bw, LOCAL_FORWARD).is_empty());

        bw.set_global_alert(4096).unwrap();
        let alert = "-m quota2 ! --quota 4096 --name globalAlert".to_string();
        assert_eq!(rules(&bw, LOCAL_FORWARD), vec![alert.clone()]);
        assert_eq!(rules(&bw, LOCAL_INPUT)[0], alert);
        assert_eq!(rules(&bw, LOCAL_OUTPUT)[0], alert);

        bw.remove_global_alert_in_forward_chain().unwrap();
        assert_eq!(rules(&bw, LOCAL_FORWARD), vec![alert]);
        bw.remove_global_alert_in_forward_chain().unwrap();
        assert!(rules(&bw, LOCAL_FORWARD).is_empty());
        assert!(matches!(
            bw.remove_global_alert_in_forward_chain(),
            Err(ControllerError::NotInState(_))
        ));
        assert_eq!(bw.state().global_alert_tether_count, 0);
    }

    #[test]
    fn first_tether_installs_forward_alert_once() {
        let (mut bw, _dir) = enabled();
        bw.set_global_alert(2048).unwrap();
        bw.set_global_alert_in_forward_chain().unwrap();
        bw.set_global_alert_in_forward_chain().unwrap();
        assert_eq!(rules(&bw, LOCAL_FORWARD).len(), 1);

        bw.remove_global_alert().unwrap();
        assert!(rules(&bw, LOCAL_FORWARD).is_empty());
        assert_eq!(rules(&bw, LOCAL_INPUT), vec!["-m owner --socket-exists"]);
        assert!(matches!(
            bw.remove_global_alert(),
            Err(ControllerError::NoAlertConfigured(_))
        ));
    }

    #[test]
    fn global_alert_stays_first_in_hook_chains() {
        let (mut bw, dir) = enabled();
        bw.set_global_alert(1000).unwrap();
        bw.set_interface_quota("rmnet0", 50000).unwrap();
        let input = rules(&bw, LOCAL_INPUT);
        assert_eq!(input[0], "-m quota2 ! --quota 1000 --name globalAlert");
        assert_eq!(input[1], "-i rmnet0 --jump bw_costly_rmnet0");

        bw.set_global_alert(3000).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("globalAlert")).unwrap(),
            "3000\n"
        );
        assert!(matches!(
            bw.set_global_alert(0),
            Err(ControllerError::InvalidQuotaValue(0))
        ));
    }

    #[test]
    fn interface_alert_lifecycle() {
        let (mut bw, dir) = enabled();
        assert!(matches!(
            bw.set_interface_alert("rmnet0", 100),
            Err(ControllerError::NotInState(_))
        ));
        bw.set_interface_quota("rmnet0", 50000).unwrap();
        bw.set_interface_alert("rmnet0", 100).unwrap();
        assert_eq!(
            rules(&bw, "bw_costly_rmnet0").last().unwrap(),
            "-m quota2 ! --quota 100 --name rmnet0Alert"
        );

        bw.set_interface_alert("rmnet0", 250).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("rmnet0Alert")).unwrap(),
            "250\n"
        );

        bw.remove_interface_alert("rmnet0").unwrap();
        assert_eq!(rules(&bw, "bw_costly_rmnet0").len(), 2);
        assert!(matches!(
            bw.remove_interface_alert("rmnet0"),
            Err(ControllerError::NoAlertConfigured(_))
        ));
    }

    #[test]
    fn data_saver_replaces_first_rule() {
        let (mut bw, _dir) = enabled();
        bw.enable_data_saver(true).unwrap();
        assert_eq!(rules(&bw, DATA_SAVER_CHAIN), vec!["--jump REJECT"]);
        assert_eq!(
            bw.backend.batches.last().unwrap().1,
            "*filter\n-R bw_data_saver 1 --jump REJECT\nCOMMIT\n"
        );
        bw.enable_data_saver(false).unwrap();
        assert_eq!(rules(&bw, DATA_SAVER_CHAIN), vec!["--jump RETURN"]);
    }

    #[test]
    fn enable_resets_state_and_disable_flushes() {
        let (mut bw, _dir) = enabled();
        bw.set_interface_shared_quota("wlan0", 100).unwrap();
        bw.enable_bandwidth_control().unwrap();
        assert_eq!(*bw.state(), OrchestratorState::default());
        assert_eq!(rules(&bw, LOCAL_INPUT), vec!["-m owner --socket-exists"]);

        bw.disable_bandwidth_control().unwrap();
        assert!(rules(&bw, NAUGHTY_CHAIN).is_empty());
    }

    #[test]
    fn shared_quota_reads_live_file() {
        let (bw, dir) = enabled();
        fs::write(dir.path().join("shared"), "123456\n").unwrap();
        assert_eq!(bw.get_interface_shared_quota().unwrap(), 123456);
        assert!(matches!(
            bw.get_interface_quota("rmnet9"),
            Err(ControllerError::Io { .. })
        ));
    }
}
