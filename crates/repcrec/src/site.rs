//! A single storage replica: durable committed state, a lock table, the
//! up/down recovery state machine, and per-transaction staged writes.
//!
//! A recovered site marks every replicated variable it hosts as stale;
//! reads of a stale copy are refused until a committed write overwrites it.
//! Non-replicated variables have their only copy here, so they come back
//! readable immediately.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use smallvec::SmallVec;
use tracing::{debug, info};

use repcrec_error::Result;
use repcrec_storage::SiteStore;
use repcrec_types::{LockMode, SiteId, Tick, TxnId, VariableId};

use crate::lock_table::{Acquire, Blockers, LockTable, PromotedGrant};

/// Up/down state of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteStatus {
    Up,
    Down,
}

/// Outcome of a read-lock request at this site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadLock {
    /// Lock held; `read_committed` may be called.
    Granted,
    /// Conflicting lock traffic; caller decides wait vs die.
    Wait(Blockers),
    /// The copy here is post-recovery stale; try another replica.
    Stale,
    /// The site is down.
    Down,
}

/// Outcome of a write-lock request at this site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteLock {
    Granted,
    Wait(Blockers),
    Down,
}

/// One storage site.
#[derive(Debug)]
pub struct Site {
    store: SiteStore,
    locks: LockTable,
    status: SiteStatus,
    up_since: Tick,
    /// Replicated variables unreadable here since the last recovery.
    stale: BTreeSet<VariableId>,
    /// Writes staged by active transactions, applied at commit.
    staged: HashMap<TxnId, SmallVec<[(VariableId, i64); 4]>>,
}

impl Site {
    /// Wrap an opened store into an up site.
    #[must_use]
    pub fn new(store: SiteStore) -> Self {
        Self {
            store,
            locks: LockTable::new(),
            status: SiteStatus::Up,
            up_since: Tick::ZERO,
            stale: BTreeSet::new(),
            staged: HashMap::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SiteId {
        self.store.site()
    }

    #[must_use]
    pub fn status(&self) -> SiteStatus {
        self.status
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.status == SiteStatus::Up
    }

    /// Tick of initial load or last recovery.
    #[must_use]
    pub fn up_since(&self) -> Tick {
        self.up_since
    }

    /// Whether this site hosts a copy of `variable`.
    #[must_use]
    pub fn hosts(&self, variable: VariableId) -> bool {
        self.store.hosts(variable)
    }

    /// Whether the copy of `variable` here is post-recovery stale.
    #[must_use]
    pub fn is_stale(&self, variable: VariableId) -> bool {
        self.stale.contains(&variable)
    }

    /// Committed values in variable order (for dumps).
    #[must_use]
    pub fn committed_values(&self) -> &BTreeMap<VariableId, i64> {
        self.store.values()
    }

    /// Request a shared lock for a committed read.
    pub fn read_lock(&mut self, txn: TxnId, variable: VariableId) -> ReadLock {
        if !self.is_up() {
            return ReadLock::Down;
        }
        debug_assert!(self.hosts(variable), "read_lock for unhosted {variable}");
        if self.stale.contains(&variable) {
            return ReadLock::Stale;
        }
        match self.locks.try_acquire(txn, variable, LockMode::Shared) {
            Acquire::Granted => ReadLock::Granted,
            Acquire::Wait(blockers) => ReadLock::Wait(blockers),
        }
    }

    /// Request an exclusive lock. Staleness does not block write locks;
    /// the commit of the buffered write is what clears it.
    pub fn write_lock(&mut self, txn: TxnId, variable: VariableId) -> WriteLock {
        if !self.is_up() {
            return WriteLock::Down;
        }
        debug_assert!(self.hosts(variable), "write_lock for unhosted {variable}");
        match self.locks.try_acquire(txn, variable, LockMode::Exclusive) {
            Acquire::Granted => WriteLock::Granted,
            Acquire::Wait(blockers) => WriteLock::Wait(blockers),
        }
    }

    /// Read the committed value, honoring the transaction's own staged write
    /// if it has one here.
    ///
    /// # Panics
    ///
    /// Calling without a granted read lock (site down or variable unhosted)
    /// is a programmer error.
    #[must_use]
    pub fn read_committed(&self, txn: TxnId, variable: VariableId) -> i64 {
        assert!(self.is_up(), "read_committed on a down site");
        if let Some(writes) = self.staged.get(&txn) {
            if let Some(&(_, value)) = writes.iter().rev().find(|&&(v, _)| v == variable) {
                return value;
            }
        }
        self.store
            .read(variable)
            .expect("read_committed for unhosted variable")
    }

    /// Stage a write to be installed at commit.
    ///
    /// # Panics
    ///
    /// The caller must hold the exclusive lock here.
    pub fn buffer_write(&mut self, txn: TxnId, variable: VariableId, value: i64) {
        assert!(
            self.locks.holds_exclusive(txn, variable),
            "buffer_write without exclusive lock on {variable}"
        );
        let writes = self.staged.entry(txn).or_default();
        // Re-buffering the same variable replaces the staged value.
        writes.retain(|&mut (v, _)| v != variable);
        writes.push((variable, value));
        debug!(site = %self.id(), %txn, %variable, value, "write staged");
    }

    /// Install `txn`'s staged writes, clear their staleness, and release all
    /// of `txn`'s locks. Returns the lock grants produced by queue promotion.
    ///
    /// # Errors
    ///
    /// Propagates storage I/O failures from the durable install.
    pub fn commit(&mut self, txn: TxnId) -> Result<Vec<PromotedGrant>> {
        debug_assert!(self.is_up(), "commit routed to a down site");
        if let Some(writes) = self.staged.remove(&txn) {
            self.store.install(&writes)?;
            for &(variable, _) in &writes {
                self.stale.remove(&variable);
            }
            debug!(site = %self.id(), %txn, writes = writes.len(), "staged writes installed");
        }
        Ok(self.locks.release_all(txn))
    }

    /// Discard `txn`'s staged writes and release all of its locks.
    pub fn abort(&mut self, txn: TxnId) -> Vec<PromotedGrant> {
        self.staged.remove(&txn);
        self.locks.release_all(txn)
    }

    /// Transition `Up -> Down`: lock state and staged writes vanish; the
    /// committed store is untouched.
    pub fn fail(&mut self) {
        debug_assert!(self.is_up(), "fail on a down site");
        self.status = SiteStatus::Down;
        self.locks.clear();
        self.staged.clear();
        self.stale.clear();
        info!(site = %self.id(), "site down");
    }

    /// Transition `Down -> Up` at `tick`: every hosted replicated variable
    /// becomes stale until the next committed write here.
    pub fn recover(&mut self, tick: Tick) {
        debug_assert!(!self.is_up(), "recover on an up site");
        self.status = SiteStatus::Up;
        self.up_since = tick;
        self.stale = self
            .store
            .values()
            .keys()
            .copied()
            .filter(|v| v.is_replicated())
            .collect();
        info!(site = %self.id(), %tick, stale = self.stale.len(), "site recovered");
    }
}
