//! Shared vocabulary for the RepCRec replicated database.
//!
//! Foundation types only: id newtypes, the logical clock, lock modes,
//! transaction lifecycle enums, and the operation records exchanged between
//! the command parser and the coordinator. Runtime machinery (sites, lock
//! tables, the coordinator itself) lives in the `repcrec` crate.

pub mod command;

pub use command::Command;

use std::fmt;
use std::num::NonZeroU32;

/// A storage site identifier.
///
/// Site ids are 1-based; site 0 does not exist. The reference configuration
/// runs sites `1..=10`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SiteId(NonZeroU32);

impl SiteId {
    /// Create a new site id from a raw u32.
    ///
    /// Returns `None` if `n` is 0.
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named integer variable, `x1 .. xN`.
///
/// Even-indexed variables are replicated on every site; odd-indexed variables
/// live on exactly one site.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct VariableId(NonZeroU32);

impl VariableId {
    /// Create a new variable id from a raw index.
    ///
    /// Returns `None` if `n` is 0 (variables are 1-based).
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw 1-based index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0.get()
    }

    /// Whether this variable is replicated on every site (even index).
    #[inline]
    #[must_use]
    pub const fn is_replicated(self) -> bool {
        self.0.get() % 2 == 0
    }

    /// The default initial value installed at load time: `10 * index`.
    #[inline]
    #[must_use]
    pub const fn default_value(self) -> i64 {
        10 * self.0.get() as i64
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// A transaction identifier, `T1 .. Tk`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(NonZeroU32);

impl TxnId {
    /// Create a new transaction id from a raw u32.
    ///
    /// Returns `None` if `n` is 0.
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw u32 value.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// A monotonically increasing logical clock tick.
///
/// The coordinator advances the tick once per processed command. Transaction
/// start times and commit times are both ticks, so wait-die age comparisons
/// and multiversion snapshot lookups share one timeline. Tick 0 is the
/// initial database load.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Tick(u64);

impl Tick {
    /// The initial-load tick.
    pub const ZERO: Self = Self(0);

    /// Create a tick from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(t: u64) -> Self {
        Self(t)
    }

    /// Get the raw value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following tick.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Lock mode requested or held at a site's lock table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum LockMode {
    /// Shared read lock; mutually compatible.
    Shared,
    /// Exclusive write lock; compatible with nothing.
    Exclusive,
}

impl LockMode {
    /// Whether two held/requested modes may coexist on one variable.
    #[inline]
    #[must_use]
    pub const fn compatible_with(self, other: Self) -> bool {
        matches!((self, other), (Self::Shared, Self::Shared))
    }
}

/// Transaction flavor, fixed at `begin` / `beginRO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnKind {
    /// Strict two-phase locking with wait-die.
    ReadWrite,
    /// Lock-free multiversion snapshot reads.
    ReadOnly,
}

/// Transaction lifecycle state.
///
/// `Committed` and `Aborted` are terminal; a transaction never re-enters
/// `Active` or `Blocked` from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnState {
    Active,
    Blocked,
    Committed,
    Aborted,
}

impl TxnState {
    /// Whether the transaction has reached a terminal state.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Final outcome recorded in the commit/abort log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    Aborted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => f.write_str("committed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Why an aborted transaction aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Younger transaction requested a lock held by an older one.
    WaitDie,
    /// A site accessed by the transaction failed before its `end`.
    SiteDownDuringAccess,
    /// No replica of a variable stayed up across the read-only validity
    /// window.
    ReadOnlyUnavailableHistory,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitDie => f.write_str("wait-die"),
            Self::SiteDownDuringAccess => f.write_str("accessed site went down"),
            Self::ReadOnlyUnavailableHistory => f.write_str("no replica covers snapshot history"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_reject_zero() {
        assert!(SiteId::new(0).is_none());
        assert!(VariableId::new(0).is_none());
        assert!(TxnId::new(0).is_none());
        assert_eq!(SiteId::new(3).unwrap().get(), 3);
    }

    #[test]
    fn display_forms_match_script_syntax() {
        assert_eq!(VariableId::new(4).unwrap().to_string(), "x4");
        assert_eq!(TxnId::new(12).unwrap().to_string(), "T12");
        assert_eq!(SiteId::new(7).unwrap().to_string(), "7");
        assert_eq!(Tick::new(5).to_string(), "t5");
    }

    #[test]
    fn replication_follows_index_parity() {
        assert!(VariableId::new(2).unwrap().is_replicated());
        assert!(VariableId::new(20).unwrap().is_replicated());
        assert!(!VariableId::new(1).unwrap().is_replicated());
        assert!(!VariableId::new(19).unwrap().is_replicated());
    }

    #[test]
    fn default_values_are_ten_times_index() {
        assert_eq!(VariableId::new(1).unwrap().default_value(), 10);
        assert_eq!(VariableId::new(20).unwrap().default_value(), 200);
    }

    #[test]
    fn lock_compatibility_matrix() {
        use LockMode::{Exclusive, Shared};
        assert!(Shared.compatible_with(Shared));
        assert!(!Shared.compatible_with(Exclusive));
        assert!(!Exclusive.compatible_with(Shared));
        assert!(!Exclusive.compatible_with(Exclusive));
    }

    #[test]
    fn tick_ordering_and_next() {
        let t = Tick::ZERO;
        assert!(t < t.next());
        assert_eq!(t.next().get(), 1);
    }

    #[test]
    fn terminal_states() {
        assert!(TxnState::Committed.is_terminal());
        assert!(TxnState::Aborted.is_terminal());
        assert!(!TxnState::Active.is_terminal());
        assert!(!TxnState::Blocked.is_terminal());
    }
}
