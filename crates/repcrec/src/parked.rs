//! Parked operations and their wake-up conditions.
//!
//! A transaction whose head operation cannot make progress parks on a set of
//! guard conditions. The guards are alternatives: firing any one of them
//! makes the transaction ready, and the re-driven operation either completes
//! or parks again with a fresh guard. Ready transactions are handed back in
//! their original parking order.

use std::collections::BTreeMap;

use repcrec_types::{SiteId, TxnId, VariableId};

/// A condition whose firing should re-drive a parked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Condition {
    /// Lock traffic on `variable` at `site` changed (a release granted
    /// queued requests, or the site failed and its lock table vanished).
    LockReleased { site: SiteId, variable: VariableId },
    /// `site` transitioned up.
    SiteUp(SiteId),
    /// A committed write to `variable` was published (clears staleness
    /// somewhere).
    CommittedWrite(VariableId),
}

#[derive(Debug)]
struct ParkedTxn {
    seq: u64,
    guard: Vec<Condition>,
}

/// Index of parked transactions by wake-up condition.
#[derive(Debug, Default)]
pub struct ParkIndex {
    parked: BTreeMap<TxnId, ParkedTxn>,
    next_seq: u64,
}

impl ParkIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `txn` on `guard`. Re-parking replaces the guard.
    pub fn park(&mut self, txn: TxnId, guard: Vec<Condition>) {
        debug_assert!(!guard.is_empty(), "parking {txn} with an empty guard");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.parked.insert(txn, ParkedTxn { seq, guard });
    }

    /// Remove `txn` from the index (it ended or resumed).
    pub fn unpark(&mut self, txn: TxnId) {
        self.parked.remove(&txn);
    }

    #[must_use]
    pub fn is_parked(&self, txn: TxnId) -> bool {
        self.parked.contains_key(&txn)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Fire a batch of conditions: every transaction whose guard mentions
    /// any of them becomes ready and leaves the index. Ready transactions
    /// are returned in parking order.
    pub fn fire(&mut self, conditions: &[Condition]) -> Vec<TxnId> {
        self.take_where(|guard| guard.iter().any(|c| conditions.contains(c)))
    }

    /// Fire everything waiting on lock traffic at `site` (the site failed,
    /// so those waits can never be granted there).
    pub fn fire_site_locks(&mut self, site: SiteId) -> Vec<TxnId> {
        self.take_where(|guard| {
            guard
                .iter()
                .any(|c| matches!(c, Condition::LockReleased { site: s, .. } if *s == site))
        })
    }

    fn take_where(&mut self, mut matches: impl FnMut(&[Condition]) -> bool) -> Vec<TxnId> {
        let mut ready: Vec<(u64, TxnId)> = self
            .parked
            .iter()
            .filter(|(_, p)| matches(&p.guard))
            .map(|(&txn, p)| (p.seq, txn))
            .collect();
        for &(_, txn) in &ready {
            self.parked.remove(&txn);
        }
        ready.sort_unstable();
        ready.into_iter().map(|(_, txn)| txn).collect()
    }
}
