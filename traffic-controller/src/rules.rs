//! Typed rule directives, rendered to iptables syntax only at the backend
//! boundary.

use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Table {
    Filter,
    Raw,
    Mangle,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Table::Filter => "filter",
            Table::Raw => "raw",
            Table::Mangle => "mangle",
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Append,
    /// `-I chain [pos]`; no position means the head of the chain.
    Insert(Option<u32>),
    Delete,
    Replace(u32),
    NewChain,
    Flush,
    DeleteChain,
    /// `:chain -` inside a restore batch: create or flush.
    ResetChain,
    /// `-S [chain]`.
    ListRules,
    /// `-nvx -L chain`.
    ListCounters,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    InIface(String),
    OutIface(String),
    SocketExists,
    /// A single uid or an inclusive `lo-hi` range.
    UidOwner(String),
    /// Matches until `bytes` are consumed from the named quota.
    Quota2 { bytes: i64, name: String },
    SetCounters { packets: i64, bytes: i64 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    Jump(String),
    /// Same as `Jump` but rendered as `-j`.
    ShortJump(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuleDirective {
    pub op: Op,
    pub chain: String,
    pub predicates: Vec<Predicate>,
    pub target: Option<Target>,
}

impl RuleDirective {
    fn new(op: Op, chain: impl Into<String>) -> Self {
        Self {
            op,
            chain: chain.into(),
            predicates: Vec::new(),
            target: None,
        }
    }

    pub fn append(chain: impl Into<String>) -> Self {
        Self::new(Op::Append, chain)
    }

    pub fn insert(chain: impl Into<String>) -> Self {
        Self::new(Op::Insert(None), chain)
    }

    pub fn insert_at(chain: impl Into<String>, pos: u32) -> Self {
        Self::new(Op::Insert(Some(pos)), chain)
    }

    pub fn delete(chain: impl Into<String>) -> Self {
        Self::new(Op::Delete, chain)
    }

    pub fn replace(chain: impl Into<String>, pos: u32) -> Self {
        Self::new(Op::Replace(pos), chain)
    }

    pub fn new_chain(chain: impl Into<String>) -> Self {
        Self::new(Op::NewChain, chain)
    }

    pub fn flush(chain: impl Into<String>) -> Self {
        Self::new(Op::Flush, chain)
    }

    pub fn delete_chain(chain: impl Into<String>) -> Self {
        Self::new(Op::DeleteChain, chain)
    }

    pub fn reset_chain(chain: impl Into<String>) -> Self {
        Self::new(Op::ResetChain, chain)
    }

    /// Lists every chain and rule in the table.
    pub fn list_rules() -> Self {
        Self::new(Op::ListRules, "")
    }

    pub fn list_counters(chain: impl Into<String>) -> Self {
        Self::new(Op::ListCounters, chain)
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn in_iface(self, iface: &str) -> Self {
        self.with(Predicate::InIface(iface.to_string()))
    }

    pub fn out_iface(self, iface: &str) -> Self {
        self.with(Predicate::OutIface(iface.to_string()))
    }

    pub fn jump(mut self, target: impl Into<String>) -> Self {
        self.target = Some(Target::Jump(target.into()));
        self
    }

    pub fn short_jump(mut self, target: impl Into<String>) -> Self {
        self.target = Some(Target::ShortJump(target.into()));
        self
    }

    /// Command-line tokens, without the binary or its `-w` flag.
    pub fn args(&self) -> Vec<String> {
        let mut out = Vec::new();
        match &self.op {
            Op::Append => push(&mut out, ["-A", &self.chain]),
            Op::Insert(pos) => {
                push(&mut out, ["-I", &self.chain]);
                if let Some(pos) = pos {
                    out.push(pos.to_string());
                }
            }
            Op::Delete => push(&mut out, ["-D", &self.chain]),
            Op::Replace(pos) => {
                push(&mut out, ["-R", &self.chain]);
                out.push(pos.to_string());
            }
            Op::NewChain => push(&mut out, ["-N", &self.chain]),
            Op::Flush => push(&mut out, ["-F", &self.chain]),
            Op::DeleteChain => push(&mut out, ["-X", &self.chain]),
            Op::ResetChain => {
                out.push(format!(":{}", self.chain));
                out.push("-".to_string());
            }
            Op::ListRules => {
                out.push("-S".to_string());
                if !self.chain.is_empty() {
                    out.push(self.chain.clone());
                }
            }
            Op::ListCounters => push(&mut out, ["-nvx", "-L", &self.chain]),
        }

        for predicate in &self.predicates {
            match predicate {
                Predicate::InIface(iface) => push(&mut out, ["-i", iface]),
                Predicate::OutIface(iface) => push(&mut out, ["-o", iface]),
                Predicate::SocketExists => push(&mut out, ["-m", "owner", "--socket-exists"]),
                Predicate::UidOwner(uid) => push(&mut out, ["-m", "owner", "--uid-owner", uid]),
                Predicate::Quota2 { bytes, name } => {
                    push(&mut out, ["-m", "quota2", "!", "--quota"]);
                    out.push(bytes.to_string());
                    push(&mut out, ["--name", name]);
                }
                Predicate::SetCounters { packets, bytes } => {
                    out.push("--set-counters".to_string());
                    out.push(packets.to_string());
                    out.push(bytes.to_string());
                }
            }
        }

        match &self.target {
            Some(Target::Jump(t)) => push(&mut out, ["--jump", t]),
            Some(Target::ShortJump(t)) => push(&mut out, ["-j", t]),
            None => {}
        }
        out
    }
}

fn push<const N: usize>(out: &mut Vec<String>, tokens: [&str; N]) {
    out.extend(tokens.iter().map(|t| t.to_string()));
}

impl fmt::Display for RuleDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// A transactional `iptables-restore` input: one section per table, each
/// closed by `COMMIT`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RestoreBatch {
    sections: Vec<(Table, Vec<RuleDirective>)>,
}

impl RestoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: Table, directives: Vec<RuleDirective>) -> Self {
        self.sections.push((table, directives));
        self
    }

    pub fn filter(directives: Vec<RuleDirective>) -> Self {
        Self::new().table(Table::Filter, directives)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|(_, d)| d.is_empty())
    }
}

impl fmt::Display for RestoreBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (table, directives) in &self.sections {
            writeln!(f, "*{table}")?;
            for directive in directives {
                writeln!(f, "{directive}")?;
            }
            writeln!(f, "COMMIT")?;
        }
        Ok(())
    }
}

/// Accepts names of 1 to 16 characters: an ASCII alphanumeric followed by
/// alphanumerics or any of `_-:`.
pub fn is_iface_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some(first) = bytes.first() else {
        return false;
    };
    bytes.len() <= 16
        && first.is_ascii_alphanumeric()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':'))
}
