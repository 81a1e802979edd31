//! Line-oriented `bandwidth` command surface served by the daemon.
//!
//! Each line is `[bandwidth] <command> <args...>`; the reply is `ok`,
//! `ok <value>` or `error <message>`. Long and short command names are both
//! accepted.

use std::fmt::Write as _;

use log::{debug, warn};

use crate::{
    backend::RuleBackend,
    bandwidth::BandwidthController,
    error::{ControllerError, Result},
    offload::SharedReconciler,
    tether_stats::TetherFilter,
};

/// Commands that only touch iptables or the live quota files. Everything
/// else depends on orchestrator state kept by the daemon.
const STATELESS_COMMANDS: &[&str] = &[
    "getquota",
    "gq",
    "getiquota",
    "giq",
    "gettetherstats",
    "gts",
    "addnaughtyapps",
    "ana",
    "removenaughtyapps",
    "rna",
    "addniceapps",
    "ann",
    "removeniceapps",
    "rnn",
    "datasaver",
];

/// Whether `args` can run outside the daemon with a fresh controller.
fn is_stateless(args: &[&str]) -> bool {
    args.first().is_some_and(|cmd| STATELESS_COMMANDS.contains(cmd))
}

pub struct Dispatcher<B: RuleBackend> {
    bandwidth: BandwidthController<B>,
    tether_chain: String,
    offload: Option<SharedReconciler>,
}

fn syntax(usage: &str) -> ControllerError {
    ControllerError::InvalidArgument(format!("usage: {usage}"))
}

fn parse_bytes(value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| ControllerError::InvalidArgument(format!("bad byte count {value:?}")))
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(ControllerError::InvalidArgument(format!(
            "expected on or off, got {other:?}"
        ))),
    }
}

impl<B: RuleBackend> Dispatcher<B> {
    pub fn new(bandwidth: BandwidthController<B>, tether_chain: impl Into<String>) -> Self {
        Self {
            bandwidth,
            tether_chain: tether_chain.into(),
            offload: None,
        }
    }

    /// Lets `clearoffloadsamples` reach the offload watcher's reconciler.
    pub fn with_offload(mut self, offload: SharedReconciler) -> Self {
        self.offload = Some(offload);
        self
    }

    #[cfg(test)]
    pub(crate) fn bandwidth(&self) -> &BandwidthController<B> {
        &self.bandwidth
    }

    /// Runs one line and renders its reply. Blank lines get an empty reply.
    pub fn dispatch_line(&mut self, line: &str) -> String {
        let mut args: Vec<&str> = line.split_whitespace().collect();
        if args.first() == Some(&"bandwidth") {
            args.remove(0);
        }
        if args.is_empty() {
            return String::new();
        }
        debug!("bandwidth command {args:?}");
        match self.dispatch(&args) {
            Ok(None) => "ok".to_string(),
            Ok(Some(value)) => format!("ok {value}"),
            Err(err) => {
                warn!("bandwidth {} failed: {err}", args[0]);
                format!("error {err}")
            }
        }
    }

    /// Like [`Dispatcher::dispatch`] for a controller that starts with no
    /// state. Commands that need the daemon's state are refused untouched.
    pub fn dispatch_one_shot(&mut self, args: &[&str]) -> Result<Option<String>> {
        if !is_stateless(args) {
            return Err(ControllerError::InvalidArgument(format!(
                "{} needs the daemon's quota and alert state, send it to `traffic-controller daemon`",
                args.first().copied().unwrap_or("empty command")
            )));
        }
        self.dispatch(args)
    }

    pub fn dispatch(&mut self, args: &[&str]) -> Result<Option<String>> {
        let bw = &mut self.bandwidth;
        match args {
            ["enable"] => bw.enable_bandwidth_control()?,
            ["disable"] => bw.disable_bandwidth_control()?,

            ["removequota" | "rq", iface] => bw.remove_interface_shared_quota(iface)?,
            ["removequota" | "rq", ..] => return Err(syntax("removequota <interface>")),
            ["getquota" | "gq"] => return Ok(Some(bw.get_interface_shared_quota()?.to_string())),
            ["getiquota" | "giq", iface] => {
                return Ok(Some(bw.get_interface_quota(iface)?.to_string()));
            }
            ["getiquota" | "giq", ..] => return Err(syntax("getiquota <interface>")),
            ["setquota" | "sq", iface, bytes] => {
                bw.set_interface_shared_quota(iface, parse_bytes(bytes)?)?
            }
            ["setquota" | "sq", ..] => return Err(syntax("setquota <interface> <bytes>")),
            ["setquotas" | "sqs", bytes, ifaces @ ..] if !ifaces.is_empty() => {
                let bytes = parse_bytes(bytes)?;
                for iface in ifaces {
                    bw.set_interface_shared_quota(iface, bytes)?;
                }
            }
            ["setquotas" | "sqs", ..] => return Err(syntax("setquotas <bytes> <interface> ...")),
            ["removequotas" | "rqs", ifaces @ ..] if !ifaces.is_empty() => {
                for iface in ifaces {
                    bw.remove_interface_shared_quota(iface)?;
                }
            }
            ["removequotas" | "rqs"] => return Err(syntax("removequotas <interface> ...")),
            ["removeiquota" | "riq", iface] => bw.remove_interface_quota(iface)?,
            ["removeiquota" | "riq", ..] => return Err(syntax("removeiquota <interface>")),
            ["setiquota" | "siq", iface, bytes] => {
                bw.set_interface_quota(iface, parse_bytes(bytes)?)?
            }
            ["setiquota" | "siq", ..] => return Err(syntax("setiquota <interface> <bytes>")),

            ["addnaughtyapps" | "ana", uids @ ..] if !uids.is_empty() => bw.add_naughty_apps(uids)?,
            ["removenaughtyapps" | "rna", uids @ ..] if !uids.is_empty() => {
                bw.remove_naughty_apps(uids)?
            }
            ["addniceapps" | "ann", uids @ ..] if !uids.is_empty() => bw.add_nice_apps(uids)?,
            ["removeniceapps" | "rnn", uids @ ..] if !uids.is_empty() => {
                bw.remove_nice_apps(uids)?
            }
            ["addnaughtyapps" | "ana" | "removenaughtyapps" | "rna" | "addniceapps" | "ann"
            | "removeniceapps" | "rnn"] => return Err(syntax("<apps command> <appUid> ...")),
            ["datasaver", switch] => bw.enable_data_saver(parse_switch(switch)?)?,

            ["setglobalalert" | "sga", bytes] => bw.set_global_alert(parse_bytes(bytes)?)?,
            ["setglobalalert" | "sga", ..] => return Err(syntax("setglobalalert <bytes>")),
            // Interfaces are accepted for compatibility and ignored.
            ["debugsettetherglobalalert" | "dstga", _, _] => bw.set_global_alert_in_forward_chain()?,
            ["removeglobalalert" | "rga"] => bw.remove_global_alert()?,
            ["debugremovetetherglobalalert" | "drtga", _, _] => {
                bw.remove_global_alert_in_forward_chain()?
            }
            ["setsharedalert" | "ssa", bytes] => bw.set_shared_alert(parse_bytes(bytes)?)?,
            ["setsharedalert" | "ssa", ..] => return Err(syntax("setsharedalert <bytes>")),
            ["removesharedalert" | "rsa"] => bw.remove_shared_alert()?,
            ["setinterfacealert" | "sia", iface, bytes] => {
                bw.set_interface_alert(iface, parse_bytes(bytes)?)?
            }
            ["setinterfacealert" | "sia", ..] => {
                return Err(syntax("setinterfacealert <interface> <bytes>"));
            }
            ["removeinterfacealert" | "ria", iface] => bw.remove_interface_alert(iface)?,
            ["removeinterfacealert" | "ria", ..] => {
                return Err(syntax("removeinterfacealert <interface>"));
            }

            // Sent when a tethered interface goes down.
            ["clearoffloadsamples" | "cos"] => match &self.offload {
                Some(offload) => offload.lock().clear_prev_stats(),
                None => {
                    return Err(ControllerError::NotInState(
                        "offload reconciler not running".to_string(),
                    ));
                }
            },

            ["gettetherstats" | "gts", ifaces @ ..] if ifaces.len() <= 2 => {
                let filter = TetherFilter {
                    int_iface: ifaces.first().map(|s| s.to_string()),
                    ext_iface: ifaces.get(1).map(|s| s.to_string()),
                };
                let stats = bw.get_tether_stats(&self.tether_chain, &filter)?;
                let mut out = String::new();
                for (i, s) in stats.iter().enumerate() {
                    if i > 0 {
                        out.push('\n');
                    }
                    let _ = write!(
                        out,
                        "{} {} {} {} {} {}",
                        s.int_iface, s.ext_iface, s.rx_bytes, s.rx_packets, s.tx_bytes, s.tx_packets
                    );
                }
                return Ok(Some(out));
            }

            [other, ..] => {
                return Err(ControllerError::InvalidArgument(format!(
                    "unknown bandwidth command {other:?}"
                )));
            }
            [] => return Err(syntax("<command> <args...>")),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{IpVersion, testing::RecordingBackend},
        offload::{OffloadReconciler, OffloadStats, PairCounters},
    };

    fn dispatcher() -> Dispatcher<RecordingBackend> {
        let dir = std::env::temp_dir();
        let mut d = Dispatcher::new(
            BandwidthController::new(RecordingBackend::new(), dir),
            "tetherctrl_counters",
        );
        assert_eq!(d.dispatch_line("bandwidth enable"), "ok");
        d
    }

    #[test]
    fn long_and_short_names_are_equivalent() {
        let mut d = dispatcher();
        assert_eq!(d.dispatch_line("setiquota rmnet0 500000"), "ok");
        assert_eq!(d.bandwidth().state().quota_ifaces.len(), 1);
        assert_eq!(d.dispatch_line("riq rmnet0"), "ok");
        assert!(d.bandwidth().state().quota_ifaces.is_empty());
    }

    #[test]
    fn setquotas_applies_to_each_interface() {
        let mut d = dispatcher();
        assert_eq!(d.dispatch_line("sqs 1000 rmnet0 rmnet1"), "ok");
        assert_eq!(
            d.bandwidth().state().shared_quota_ifaces,
            vec!["rmnet0".to_string(), "rmnet1".to_string()]
        );
        assert_eq!(d.dispatch_line("removequotas rmnet0 rmnet1"), "ok");
        assert!(d.bandwidth().state().shared_quota_ifaces.is_empty());
    }

    #[test]
    fn syntax_and_value_errors_are_reported() {
        let mut d = dispatcher();
        assert!(d.dispatch_line("setiquota rmnet0").starts_with("error "));
        assert!(d.dispatch_line("setiquota rmnet0 lots").contains("bad byte count"));
        assert!(d.dispatch_line("sga 0").starts_with("error "));
        assert!(d.dispatch_line("frobnicate").contains("unknown bandwidth command"));
        assert!(d.dispatch_line("ana").starts_with("error "));
        assert_eq!(d.dispatch_line("   "), "");
    }

    #[test]
    fn naughty_apps_round_trip() {
        let mut d = dispatcher();
        assert_eq!(d.dispatch_line("ana 10010 10011"), "ok");
        assert_eq!(d.dispatch_line("rna 10010"), "ok");
        assert_eq!(d.dispatch_line("datasaver on"), "ok");
    }

    #[test]
    fn tether_stats_are_rendered_one_pair_per_line() {
        let mut d = dispatcher();
        let listing = "\
      26     2373 RETURN     all  --  wlan0  rmnet0  0.0.0.0/0            0.0.0.0/0
      27     2002 RETURN     all  --  rmnet0 wlan0   0.0.0.0/0            0.0.0.0/0
";
        let v6 = "\
      10     1000 RETURN     all      wlan0  rmnet0  ::/0                 ::/0
      20     2000 RETURN     all      rmnet0 wlan0   ::/0                 ::/0
";
        let backend = d.bandwidth.backend_mut();
        backend.listings.insert(
            (IpVersion::V4, "tetherctrl_counters".to_string()),
            listing.to_string(),
        );
        backend.listings.insert(
            (IpVersion::V6, "tetherctrl_counters".to_string()),
            v6.to_string(),
        );
        assert_eq!(
            d.dispatch_line("gts wlan0 rmnet0"),
            "ok wlan0 rmnet0 3373 36 4002 47"
        );
    }

    #[test]
    fn clear_offload_samples_reaches_the_watcher_state() {
        let shared = SharedReconciler::new(OffloadReconciler::new("natctrl_hw_tether_counters"));
        let mut d = dispatcher().with_offload(shared.clone());
        let record = |rx_bytes| OffloadStats {
            iif: "rndis0".to_string(),
            oif: "rmnet0".to_string(),
            counters: PairCounters {
                rx_bytes,
                ..PairCounters::default()
            },
        };

        assert_eq!(shared.lock().correct(&record(100)).counters.rx_bytes, 100);
        assert_eq!(d.dispatch_line("cos"), "ok");
        // The interface came back with its counter restarted above zero.
        assert_eq!(shared.lock().correct(&record(120)).counters.rx_bytes, 220);

        assert!(dispatcher().dispatch_line("clearoffloadsamples").starts_with("error "));
    }

    #[test]
    fn only_stateless_commands_run_outside_the_daemon() {
        assert!(is_stateless(&["gts", "wlan0"]));
        assert!(is_stateless(&["ana", "10010"]));
        assert!(is_stateless(&["datasaver", "on"]));
        assert!(!is_stateless(&["setiquota", "rmnet0", "1000"]));
        assert!(!is_stateless(&["riq", "rmnet0"]));
        assert!(!is_stateless(&["removeinterfacealert", "rmnet0"]));
        assert!(!is_stateless(&["enable"]));
        assert!(!is_stateless(&[]));
    }

    #[test]
    fn one_shot_quota_commands_are_refused_before_any_rule_change() {
        let mut d = Dispatcher::new(
            BandwidthController::new(RecordingBackend::new(), std::env::temp_dir()),
            "tetherctrl_counters",
        );
        let err = d.dispatch_one_shot(&["setiquota", "rmnet0", "500000"]).unwrap_err();
        assert!(err.to_string().contains("daemon"), "{err}");
        assert!(d.dispatch_one_shot(&["removeiquota", "rmnet0"]).is_err());
        assert!(d.bandwidth.backend_mut().commands.is_empty());
        assert!(d.bandwidth.backend_mut().batches.is_empty());

        // Chains left by a running daemon.
        d.dispatch(&["enable"]).unwrap();
        d.bandwidth.backend_mut().commands.clear();
        assert_eq!(d.dispatch_one_shot(&["ana", "10010"]).unwrap(), None);
        assert_eq!(d.bandwidth.backend_mut().commands.len(), 2);
    }
}
