//! Rule-table backend: `iptables`/`ip6tables` for single directives and
//! `iptables-restore --noflush` for transactional batches.

use std::{
    fmt,
    io::{self, Write},
    process::{Child, Command, Stdio},
};

use log::{debug, error};

use crate::{
    config::ControllerConfig,
    error::{ControllerError, Result},
    rules::{RestoreBatch, RuleDirective},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const BOTH: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IpVersion::V4 => "v4",
            IpVersion::V6 => "v6",
        })
    }
}

/// Whether a failed command is logged. Cleanup of rules that may not exist
/// runs with `Hide`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureLog {
    Show,
    Hide,
}

/// A privileged rule engine. Calls block until the external command exits;
/// lock contention is waited out by the engine itself (`-w`).
pub trait RuleBackend {
    /// Runs one command and returns its stdout.
    fn run(&mut self, ip: IpVersion, args: &[String], log: FailureLog) -> Result<String>;

    /// Applies a restore batch without flushing unrelated chains and returns
    /// its stdout.
    fn restore(&mut self, ip: IpVersion, batch: &str) -> Result<String>;
}

impl<B: RuleBackend + ?Sized> RuleBackend for &mut B {
    fn run(&mut self, ip: IpVersion, args: &[String], log: FailureLog) -> Result<String> {
        (**self).run(ip, args, log)
    }

    fn restore(&mut self, ip: IpVersion, batch: &str) -> Result<String> {
        (**self).restore(ip, batch)
    }
}

/// Runs `directive` for both IP versions. Both always run; the first error
/// is returned.
pub fn run_both<B: RuleBackend + ?Sized>(
    backend: &mut B,
    directive: &RuleDirective,
    log: FailureLog,
) -> Result<()> {
    let args = directive.args();
    let mut first_err = None;
    for ip in IpVersion::BOTH {
        if let Err(err) = backend.run(ip, &args, log) {
            first_err.get_or_insert(err);
        }
    }
    first_err.map_or(Ok(()), Err)
}

/// Applies `batch` for both IP versions, stopping at the first failure.
pub fn restore_both<B: RuleBackend + ?Sized>(backend: &mut B, batch: &RestoreBatch) -> Result<()> {
    let text = batch.to_string();
    for ip in IpVersion::BOTH {
        backend.restore(ip, &text)?;
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct IptablesBackend {
    iptables: String,
    ip6tables: String,
    iptables_restore: String,
    ip6tables_restore: String,
}

impl IptablesBackend {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            iptables: config.iptables_path.clone(),
            ip6tables: config.ip6tables_path.clone(),
            iptables_restore: config.iptables_restore_path.clone(),
            ip6tables_restore: config.ip6tables_restore_path.clone(),
        }
    }

    fn binary(&self, ip: IpVersion) -> &str {
        match ip {
            IpVersion::V4 => &self.iptables,
            IpVersion::V6 => &self.ip6tables,
        }
    }

    fn restore_binary(&self, ip: IpVersion) -> &str {
        match ip {
            IpVersion::V4 => &self.iptables_restore,
            IpVersion::V6 => &self.ip6tables_restore,
        }
    }
}

impl RuleBackend for IptablesBackend {
    fn run(&mut self, ip: IpVersion, args: &[String], log: FailureLog) -> Result<String> {
        let binary = self.binary(ip);
        let command = format!("{binary} -w {}", args.join(" "));
        debug!("running {command}");

        let output = Command::new(binary)
            .arg("-w")
            .args(args)
            .output()
            .map_err(|e| ControllerError::io(format!("failed to spawn {binary}"), e))?;

        if !output.status.success() {
            if log == FailureLog::Show {
                error!(
                    "{command} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            return Err(ControllerError::backend(command, output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn restore(&mut self, ip: IpVersion, batch: &str) -> Result<String> {
        let binary = self.restore_binary(ip);
        let command = format!("{binary} --noflush -w");
        debug!("running {command} with {} bytes of input", batch.len());

        let mut child = Command::new(binary)
            .args(["--noflush", "-w"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ControllerError::io(format!("failed to spawn {binary}"), e))?;

        feed_stdin(&mut child, batch.as_bytes())
            .map_err(|e| ControllerError::io(format!("failed to feed {binary}"), e))?;
        let output = child
            .wait_with_output()
            .map_err(|e| ControllerError::io(format!("failed to wait for {binary}"), e))?;

        if !output.status.success() {
            error!(
                "{command} failed: {}\ninput was:\n{batch}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(ControllerError::backend(command, output.status));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Writes `input` to the child's stdin and closes it. On a failed write the
/// child is killed and reaped before the error is returned.
fn feed_stdin(child: &mut Child, input: &[u8]) -> io::Result<()> {
    let Some(mut stdin) = child.stdin.take() else {
        return Ok(());
    };
    if let Err(err) = stdin.write_all(input) {
        drop(stdin);
        let _ = child.kill();
        let _ = child.wait();
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! A backend that records every command and models chain contents so
    //! ordering and round-trip properties can be checked without iptables.

    use std::collections::{BTreeMap, HashMap};

    use super::*;

    type Chains = BTreeMap<(String, String), Vec<String>>;

    #[derive(Default)]
    pub struct RecordingBackend {
        /// Every single command as `"<ip> <args>"`.
        pub commands: Vec<String>,
        /// Every restore batch as sent.
        pub batches: Vec<(IpVersion, String)>,
        chains: HashMap<IpVersion, Chains>,
        /// Commands whose rendering contains one of these substrings fail.
        pub fail_on: Vec<String>,
        /// Canned `-nvx -L <chain>` output per chain and version.
        pub listings: HashMap<(IpVersion, String), String>,
    }

    impl RecordingBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_on(&mut self, pattern: &str) {
            self.fail_on.push(pattern.to_string());
        }

        /// Rules of a filter chain, rendered without the leading `-A chain`.
        pub fn rules(&self, ip: IpVersion, chain: &str) -> Option<Vec<String>> {
            self.chains
                .get(&ip)
                .and_then(|c| c.get(&("filter".to_string(), chain.to_string())))
                .cloned()
        }

        pub fn has_chain(&self, ip: IpVersion, chain: &str) -> bool {
            self.rules(ip, chain).is_some()
        }

        /// Full filter state for one version, for before/after comparisons.
        pub fn filter_state(&self, ip: IpVersion) -> Vec<(String, Vec<String>)> {
            self.chains
                .get(&ip)
                .map(|c| {
                    c.iter()
                        .filter(|((table, _), _)| table == "filter")
                        .map(|((_, chain), rules)| (chain.clone(), rules.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }

        fn failed(&self, rendered: &str) -> Option<ControllerError> {
            self.fail_on
                .iter()
                .any(|p| rendered.contains(p.as_str()))
                .then(|| ControllerError::BackendCommandFailed {
                    command: rendered.to_string(),
                    status: "exit status: 1".to_string(),
                })
        }

        fn apply(
            &mut self,
            ip: IpVersion,
            table: &str,
            args: &[String],
        ) -> std::result::Result<String, String> {
            let chains = self.chains.entry(ip).or_default();
            let Some(op) = args.first() else {
                return Err("empty command".to_string());
            };

            if let Some(chain) = op.strip_prefix(':') {
                chains
                    .entry((table.to_string(), chain.to_string()))
                    .or_default()
                    .clear();
                return Ok(String::new());
            }
            if op == "-S" {
                let mut out = String::new();
                for (t, chain) in chains.keys() {
                    if t == table {
                        out.push_str(&format!("-N {chain}\n"));
                    }
                }
                return Ok(out);
            }
            if op == "-nvx" {
                let chain = args.get(2).cloned().unwrap_or_default();
                return Ok(self.listings.get(&(ip, chain)).cloned().unwrap_or_default());
            }

            let chain = args.get(1).ok_or("missing chain")?.clone();
            let key = (table.to_string(), chain.clone());
            let rest = &args[2..];
            match op.as_str() {
                "-N" => {
                    if chains.contains_key(&key) {
                        return Err(format!("chain {chain} exists"));
                    }
                    chains.insert(key, Vec::new());
                }
                "-F" => chains.get_mut(&key).ok_or("no chain")?.clear(),
                "-X" => {
                    chains.remove(&key).ok_or("no chain")?;
                }
                "-A" => chains.get_mut(&key).ok_or("no chain")?.push(rest.join(" ")),
                "-I" | "-R" => {
                    let rules = chains.get_mut(&key).ok_or("no chain")?;
                    let (pos, spec) = match rest.first().and_then(|p| p.parse::<usize>().ok()) {
                        Some(pos) => (pos, &rest[1..]),
                        None => (1, rest),
                    };
                    if pos == 0 || pos > rules.len() + 1 {
                        return Err(format!("bad position {pos}"));
                    }
                    if op == "-I" {
                        rules.insert(pos - 1, spec.join(" "));
                    } else {
                        let slot = rules.get_mut(pos - 1).ok_or("no rule at position")?;
                        *slot = spec.join(" ");
                    }
                }
                "-D" => {
                    let rules = chains.get_mut(&key).ok_or("no chain")?;
                    // quota2 ignores the --quota value when matching a delete.
                    let spec = without_quota_value(&rest.join(" "));
                    let idx = rules
                        .iter()
                        .position(|r| without_quota_value(r) == spec)
                        .ok_or("no such rule")?;
                    rules.remove(idx);
                }
                other => return Err(format!("unsupported op {other}")),
            }
            Ok(String::new())
        }
    }

    fn without_quota_value(spec: &str) -> String {
        let mut out = Vec::new();
        let mut tokens = spec.split(' ');
        while let Some(token) = tokens.next() {
            out.push(token);
            if token == "--quota" {
                tokens.next();
            }
        }
        out.join(" ")
    }

    impl RuleBackend for RecordingBackend {
        fn run(&mut self, ip: IpVersion, args: &[String], _log: FailureLog) -> Result<String> {
            let rendered = format!("{ip} {}", args.join(" "));
            self.commands.push(rendered.clone());
            if let Some(err) = self.failed(&rendered) {
                return Err(err);
            }
            self.apply(ip, "filter", args)
                .map_err(|status| ControllerError::BackendCommandFailed {
                    command: rendered,
                    status,
                })
        }

        fn restore(&mut self, ip: IpVersion, batch: &str) -> Result<String> {
            self.batches.push((ip, batch.to_string()));
            let snapshot = self.chains.get(&ip).cloned();
            let mut table = String::from("filter");
            let mut out = String::new();
            for line in batch.lines() {
                if let Some(t) = line.strip_prefix('*') {
                    table = t.to_string();
                    continue;
                }
                if line == "COMMIT" || line.is_empty() {
                    continue;
                }
                let rendered = format!("{ip} {line}");
                let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
                let result = match self.failed(&rendered) {
                    Some(err) => Err(err),
                    None => self.apply(ip, &table, &args).map_err(|status| {
                        ControllerError::BackendCommandFailed {
                            command: rendered,
                            status,
                        }
                    }),
                };
                match result {
                    Ok(s) => out.push_str(&s),
                    Err(err) => {
                        match snapshot {
                            Some(s) => self.chains.insert(ip, s),
                            None => self.chains.remove(&ip),
                        };
                        return Err(err);
                    }
                }
            }
            Ok(out)
        }
    }
}
