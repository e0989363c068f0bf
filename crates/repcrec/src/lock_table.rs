//! Per-site variable lock table.
//!
//! Shared holders are mutually compatible; an exclusive holder excludes
//! everything. Requests that cannot be granted join a strictly FIFO wait
//! queue per variable. Release scans the queue head greedily: an exclusive
//! request is granted iff no lock is held (or the requester is the sole
//! shared holder completing an upgrade), and contiguous shared requests at
//! the head are granted together.
//!
//! The table never blocks a caller; it reports the conflicting transactions
//! and lets the coordinator apply wait-die.

use std::collections::{HashMap, VecDeque};

use smallvec::SmallVec;
use tracing::trace;

use repcrec_types::{LockMode, TxnId, VariableId};

/// Transactions blocking a request: conflicting holders plus conflicting
/// queued requests ahead of it.
pub type Blockers = SmallVec<[TxnId; 4]>;

/// Outcome of a lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// The lock is held by the requester on return.
    Granted,
    /// The request is queued; the caller decides wait vs die.
    Wait(Blockers),
}

/// A lock granted by queue promotion after a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotedGrant {
    pub variable: VariableId,
    pub txn: TxnId,
    pub mode: LockMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedRequest {
    txn: TxnId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockEntry {
    holders: SmallVec<[TxnId; 2]>,
    /// Mode of the held lock; meaningless when `holders` is empty.
    exclusive: bool,
    queue: VecDeque<QueuedRequest>,
}

impl LockEntry {
    fn is_unused(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }

    fn holds(&self, txn: TxnId) -> bool {
        self.holders.contains(&txn)
    }

    fn queue_position(&self, txn: TxnId) -> Option<usize> {
        self.queue.iter().position(|r| r.txn == txn)
    }

    fn sole_holder_is(&self, txn: TxnId) -> bool {
        self.holders.len() == 1 && self.holders[0] == txn
    }

    /// Whether a request by `txn` for `mode` can be granted right now,
    /// considering holders and every queued request ahead of `ahead_of`.
    fn grantable(&self, txn: TxnId, mode: LockMode, ahead_of: usize) -> bool {
        let holder_conflict = match mode {
            LockMode::Shared => self.exclusive && !self.holds(txn),
            LockMode::Exclusive => !self.holders.is_empty() && !self.sole_holder_is(txn),
        };
        if holder_conflict {
            return false;
        }
        let overtakes = self.queue.iter().take(ahead_of).any(|queued| match mode {
            // A shared request may not overtake a queued writer.
            LockMode::Shared => queued.mode == LockMode::Exclusive,
            // An exclusive request may not overtake anything.
            LockMode::Exclusive => true,
        });
        !overtakes
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        if !self.holds(txn) {
            self.holders.push(txn);
        }
        self.exclusive = mode == LockMode::Exclusive;
    }

    fn blockers(&self, txn: TxnId, mode: LockMode, ahead_of: usize) -> Blockers {
        let mut blockers = Blockers::new();
        let mut push = |id: TxnId| {
            if id != txn && !blockers.contains(&id) {
                blockers.push(id);
            }
        };
        let conflicts_with_holders = match mode {
            LockMode::Shared => self.exclusive,
            LockMode::Exclusive => true,
        };
        if conflicts_with_holders {
            for &holder in &self.holders {
                push(holder);
            }
        }
        for queued in self.queue.iter().take(ahead_of) {
            let conflicts = match mode {
                LockMode::Shared => queued.mode == LockMode::Exclusive,
                LockMode::Exclusive => true,
            };
            if conflicts {
                push(queued.txn);
            }
        }
        blockers
    }
}

/// One site's lock table over its hosted variables.
#[derive(Debug, Default)]
pub struct LockTable {
    entries: HashMap<VariableId, LockEntry>,
}

impl LockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a lock on `variable` for `txn`.
    ///
    /// Granting is idempotent: a holder re-requesting a mode it already
    /// satisfies gets `Granted` back. A transaction already queued does not
    /// enqueue twice; it receives its current blocker set.
    pub fn try_acquire(&mut self, txn: TxnId, variable: VariableId, mode: LockMode) -> Acquire {
        let entry = self.entries.entry(variable).or_default();

        // Already satisfied: shared request while holding anything, or
        // exclusive request while holding exclusively.
        if entry.holds(txn) && (mode == LockMode::Shared || entry.exclusive) {
            return Acquire::Granted;
        }

        let position = entry.queue_position(txn);
        let ahead_of = position.unwrap_or(entry.queue.len());

        if entry.grantable(txn, mode, ahead_of) {
            if let Some(at) = position {
                entry.queue.remove(at);
            }
            entry.grant(txn, mode);
            trace!(%txn, %variable, ?mode, "lock granted");
            return Acquire::Granted;
        }

        if position.is_none() {
            entry.queue.push_back(QueuedRequest { txn, mode });
        }
        let blockers = entry.blockers(txn, mode, ahead_of);
        trace!(%txn, %variable, ?mode, ?blockers, "lock request queued");
        Acquire::Wait(blockers)
    }

    /// Whether `txn` holds an exclusive lock on `variable`.
    #[must_use]
    pub fn holds_exclusive(&self, txn: TxnId, variable: VariableId) -> bool {
        self.entries
            .get(&variable)
            .is_some_and(|e| e.exclusive && e.holds(txn))
    }

    /// Whether any lock state (held or queued) exists for `variable`.
    #[must_use]
    pub fn is_locked(&self, variable: VariableId) -> bool {
        self.entries.get(&variable).is_some_and(|e| !e.is_unused())
    }

    /// Drop every lock and queue entry owned by `txn`, then promote waiters.
    ///
    /// Returns the grants produced by promotion, in queue order per variable.
    pub fn release_all(&mut self, txn: TxnId) -> Vec<PromotedGrant> {
        let mut promoted = Vec::new();
        self.entries.retain(|&variable, entry| {
            entry.holders.retain(|&mut h| h != txn);
            entry.queue.retain(|r| r.txn != txn);
            Self::promote(variable, entry, &mut promoted);
            !entry.is_unused()
        });
        promoted
    }

    /// Wipe the table (site failure).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Grant queued requests at the head per the wake-up discipline: one
    /// exclusive request iff nothing is held, or a contiguous run of shared
    /// requests.
    fn promote(variable: VariableId, entry: &mut LockEntry, promoted: &mut Vec<PromotedGrant>) {
        while let Some(&head) = entry.queue.front() {
            let grantable = match head.mode {
                LockMode::Exclusive => entry.holders.is_empty() || entry.sole_holder_is(head.txn),
                LockMode::Shared => entry.holders.is_empty() || !entry.exclusive,
            };
            if !grantable {
                break;
            }
            entry.queue.pop_front();
            entry.grant(head.txn, head.mode);
            promoted.push(PromotedGrant {
                variable,
                txn: head.txn,
                mode: head.mode,
            });
            if head.mode == LockMode::Exclusive {
                break;
            }
        }
    }
}
