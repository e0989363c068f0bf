//! Operation records produced by the command parser and consumed by the
//! coordinator.
//!
//! One record per textual command; `Display` renders the source syntax back
//! for diagnostics.

use std::fmt;

use crate::{SiteId, TxnId, VariableId};

/// A single parsed command from the input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Command {
    /// `begin(Tk)` — start a read-write transaction.
    Begin(TxnId),
    /// `beginRO(Tk)` — start a read-only transaction.
    BeginRo(TxnId),
    /// `R(Tk, xi)` — read a variable.
    Read(TxnId, VariableId),
    /// `W(Tk, xi, v)` — write a value to a variable.
    Write(TxnId, VariableId, i64),
    /// `end(Tk)` — finalize a transaction.
    End(TxnId),
    /// `fail(s)` — take a site down.
    Fail(SiteId),
    /// `recover(s)` — bring a site back up.
    Recover(SiteId),
    /// `dump()` — emit committed state of every site.
    DumpAll,
    /// `dump(xi)` — emit committed value of one variable per hosting site.
    DumpVariable(VariableId),
    /// `dump(s)` — emit committed state of one site.
    DumpSite(SiteId),
}

impl Command {
    /// The transaction this command belongs to, if any.
    #[must_use]
    pub const fn txn(&self) -> Option<TxnId> {
        match self {
            Self::Begin(t)
            | Self::BeginRo(t)
            | Self::Read(t, _)
            | Self::Write(t, _, _)
            | Self::End(t) => Some(*t),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Begin(t) => write!(f, "begin({t})"),
            Self::BeginRo(t) => write!(f, "beginRO({t})"),
            Self::Read(t, v) => write!(f, "R({t}, {v})"),
            Self::Write(t, v, value) => write!(f, "W({t}, {v}, {value})"),
            Self::End(t) => write!(f, "end({t})"),
            Self::Fail(s) => write!(f, "fail({s})"),
            Self::Recover(s) => write!(f, "recover({s})"),
            Self::DumpAll => f.write_str("dump()"),
            Self::DumpVariable(v) => write!(f, "dump({v})"),
            Self::DumpSite(s) => write!(f, "dump({s})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(n: u32) -> TxnId {
        TxnId::new(n).unwrap()
    }

    #[test]
    fn display_round_trips_source_syntax() {
        let var = VariableId::new(6).unwrap();
        assert_eq!(Command::Begin(txn(1)).to_string(), "begin(T1)");
        assert_eq!(Command::BeginRo(txn(2)).to_string(), "beginRO(T2)");
        assert_eq!(Command::Read(txn(1), var).to_string(), "R(T1, x6)");
        assert_eq!(Command::Write(txn(1), var, -3).to_string(), "W(T1, x6, -3)");
        assert_eq!(
            Command::Fail(SiteId::new(2).unwrap()).to_string(),
            "fail(2)"
        );
        assert_eq!(Command::DumpAll.to_string(), "dump()");
        assert_eq!(Command::DumpVariable(var).to_string(), "dump(x6)");
    }

    #[test]
    fn txn_extraction() {
        let var = VariableId::new(3).unwrap();
        assert_eq!(Command::Write(txn(4), var, 1).txn(), Some(txn(4)));
        assert_eq!(Command::DumpAll.txn(), None);
        assert_eq!(Command::Fail(SiteId::new(1).unwrap()).txn(), None);
    }
}
