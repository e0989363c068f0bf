//! Multiversion snapshot log for read-only transactions.
//!
//! Every committing read-write transaction appends one [`SnapshotRecord`]:
//! the full committed state under its commit tick, plus the set of variables
//! it actually wrote. A read-only transaction started at tick `t` resolves
//! against the record with the greatest commit tick `<= t`.
//!
//! For replicated variables the snapshot value is only trustworthy if at
//! least one hosting site held it continuously from the value's commit to
//! the reader's start; [`SiteUpHistory`] records the per-site up intervals
//! that make that predicate decidable.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::debug;

use repcrec_types::{SiteId, Tick, VariableId};

// ---------------------------------------------------------------------------
// SnapshotRecord / MultiversionStore
// ---------------------------------------------------------------------------

/// The committed state of every variable at one commit tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    commit_time: Tick,
    values: BTreeMap<VariableId, i64>,
    written: SmallVec<[VariableId; 4]>,
}

impl SnapshotRecord {
    /// The tick this snapshot was committed under.
    #[must_use]
    pub fn commit_time(&self) -> Tick {
        self.commit_time
    }

    /// The committed value of `variable` in this snapshot.
    #[must_use]
    pub fn value(&self, variable: VariableId) -> Option<i64> {
        self.values.get(&variable).copied()
    }

    /// Variables written by the commit that produced this snapshot.
    #[must_use]
    pub fn written(&self) -> &[VariableId] {
        &self.written
    }
}

/// Append-only log of committed snapshots.
#[derive(Debug)]
pub struct MultiversionStore {
    snapshots: Vec<SnapshotRecord>,
}

impl MultiversionStore {
    /// Create the store with the initial load installed at tick 0.
    #[must_use]
    pub fn new(initial: BTreeMap<VariableId, i64>) -> Self {
        Self {
            snapshots: vec![SnapshotRecord {
                commit_time: Tick::ZERO,
                values: initial,
                written: SmallVec::new(),
            }],
        }
    }

    /// Append the snapshot produced by a commit: the previous committed state
    /// overlaid with `writes`, under `commit_time`.
    ///
    /// # Panics
    ///
    /// Commit ticks must be strictly increasing; violating that is a
    /// programmer error in the coordinator.
    pub fn publish(&mut self, commit_time: Tick, writes: &BTreeMap<VariableId, i64>) {
        let latest = self.latest();
        assert!(
            commit_time > latest.commit_time,
            "commit tick {commit_time} not after {}",
            latest.commit_time
        );
        let mut values = latest.values.clone();
        let mut written = SmallVec::new();
        for (&variable, &value) in writes {
            values.insert(variable, value);
            written.push(variable);
        }
        debug!(%commit_time, written = written.len(), "snapshot published");
        self.snapshots.push(SnapshotRecord {
            commit_time,
            values,
            written,
        });
    }

    /// The most recent snapshot.
    #[must_use]
    pub fn latest(&self) -> &SnapshotRecord {
        self.snapshots.last().expect("initial snapshot always present")
    }

    /// The snapshot with the greatest commit tick `<= at`.
    #[must_use]
    pub fn snapshot_at(&self, at: Tick) -> &SnapshotRecord {
        let idx = self.snapshots.partition_point(|r| r.commit_time <= at);
        // idx >= 1 because the initial record is at tick 0.
        &self.snapshots[idx - 1]
    }

    /// The value of `variable` visible to a reader started at `at`.
    #[must_use]
    pub fn value_at(&self, variable: VariableId, at: Tick) -> Option<i64> {
        self.snapshot_at(at).value(variable)
    }

    /// The tick at which the value visible at `at` was committed: the
    /// greatest commit tick `<= at` that wrote `variable`, or tick 0 for the
    /// initial load.
    #[must_use]
    pub fn last_commit_of(&self, variable: VariableId, at: Tick) -> Tick {
        let upper = self.snapshots.partition_point(|r| r.commit_time <= at);
        self.snapshots[..upper]
            .iter()
            .rev()
            .find(|r| r.written.contains(&variable))
            .map_or(Tick::ZERO, |r| r.commit_time)
    }
}

// ---------------------------------------------------------------------------
// SiteUpHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpSpan {
    up_since: Tick,
    down_at: Option<Tick>,
}

/// Per-site history of up intervals, driven by `fail`/`recover` ticks.
#[derive(Debug)]
pub struct SiteUpHistory {
    spans: BTreeMap<SiteId, Vec<UpSpan>>,
}

impl SiteUpHistory {
    /// All sites start up at tick 0.
    #[must_use]
    pub fn new(sites: impl Iterator<Item = SiteId>) -> Self {
        Self {
            spans: sites
                .map(|s| {
                    (
                        s,
                        vec![UpSpan {
                            up_since: Tick::ZERO,
                            down_at: None,
                        }],
                    )
                })
                .collect(),
        }
    }

    /// Close the open up-interval of `site` at `tick`.
    pub fn record_down(&mut self, site: SiteId, tick: Tick) {
        let spans = self.spans.get_mut(&site).expect("unknown site");
        let open = spans.last_mut().expect("site has at least one span");
        debug_assert!(open.down_at.is_none(), "site {site} already down");
        open.down_at = Some(tick);
    }

    /// Open a new up-interval for `site` at `tick`.
    pub fn record_up(&mut self, site: SiteId, tick: Tick) {
        let spans = self.spans.get_mut(&site).expect("unknown site");
        debug_assert!(
            spans.last().is_some_and(|s| s.down_at.is_some()),
            "site {site} is not down"
        );
        spans.push(UpSpan {
            up_since: tick,
            down_at: None,
        });
    }

    /// Whether `site` was continuously up across `[from, to]`.
    #[must_use]
    pub fn covers(&self, site: SiteId, from: Tick, to: Tick) -> bool {
        debug_assert!(from <= to);
        self.spans
            .get(&site)
            .is_some_and(|spans| {
                spans
                    .iter()
                    .any(|s| s.up_since <= from && s.down_at.is_none_or(|d| d > to))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(n: u32) -> VariableId {
        VariableId::new(n).unwrap()
    }

    fn site(n: u32) -> SiteId {
        SiteId::new(n).unwrap()
    }

    fn initial() -> BTreeMap<VariableId, i64> {
        (1..=20).map(|i| (var(i), i64::from(i) * 10)).collect()
    }

    fn writes(pairs: &[(u32, i64)]) -> BTreeMap<VariableId, i64> {
        pairs.iter().map(|&(v, value)| (var(v), value)).collect()
    }

    #[test]
    fn snapshot_resolution_picks_greatest_at_or_before() {
        let mut store = MultiversionStore::new(initial());
        store.publish(Tick::new(5), &writes(&[(2, 21)]));
        store.publish(Tick::new(8), &writes(&[(2, 22)]));

        assert_eq!(store.value_at(var(2), Tick::new(4)), Some(20));
        assert_eq!(store.value_at(var(2), Tick::new(5)), Some(21));
        assert_eq!(store.value_at(var(2), Tick::new(7)), Some(21));
        assert_eq!(store.value_at(var(2), Tick::new(9)), Some(22));
    }

    #[test]
    fn later_commits_are_invisible_to_earlier_readers() {
        let mut store = MultiversionStore::new(initial());
        store.publish(Tick::new(6), &writes(&[(4, 99)]));

        // A reader pinned at tick 3 never sees the tick-6 commit.
        assert_eq!(store.value_at(var(4), Tick::new(3)), Some(40));
    }

    #[test]
    fn snapshots_accumulate_unwritten_variables() {
        let mut store = MultiversionStore::new(initial());
        store.publish(Tick::new(3), &writes(&[(2, 21)]));
        store.publish(Tick::new(7), &writes(&[(6, 61)]));

        let snap = store.snapshot_at(Tick::new(7));
        assert_eq!(snap.value(var(2)), Some(21));
        assert_eq!(snap.value(var(6)), Some(61));
        assert_eq!(snap.value(var(8)), Some(80));
    }

    #[test]
    fn last_commit_tracks_per_variable_history() {
        let mut store = MultiversionStore::new(initial());
        store.publish(Tick::new(3), &writes(&[(2, 21)]));
        store.publish(Tick::new(7), &writes(&[(6, 61)]));

        assert_eq!(store.last_commit_of(var(2), Tick::new(10)), Tick::new(3));
        assert_eq!(store.last_commit_of(var(6), Tick::new(10)), Tick::new(7));
        assert_eq!(store.last_commit_of(var(6), Tick::new(6)), Tick::ZERO);
        assert_eq!(store.last_commit_of(var(8), Tick::new(10)), Tick::ZERO);
    }

    #[test]
    #[should_panic(expected = "not after")]
    fn publish_rejects_non_monotonic_ticks() {
        let mut store = MultiversionStore::new(initial());
        store.publish(Tick::new(5), &writes(&[(2, 1)]));
        store.publish(Tick::new(5), &writes(&[(2, 2)]));
    }

    #[test]
    fn up_history_brackets_intervals() {
        let mut history = SiteUpHistory::new((1..=3).map(site));
        history.record_down(site(2), Tick::new(5));
        history.record_up(site(2), Tick::new(9));

        // Continuously up across the whole window before the failure.
        assert!(history.covers(site(2), Tick::ZERO, Tick::new(4)));
        // The failure at t5 breaks any window reaching past it.
        assert!(!history.covers(site(2), Tick::new(3), Tick::new(6)));
        assert!(!history.covers(site(2), Tick::ZERO, Tick::new(5)));
        // The recovered interval starts at t9, not at tick 0.
        assert!(!history.covers(site(2), Tick::new(8), Tick::new(10)));
        assert!(history.covers(site(2), Tick::new(9), Tick::new(12)));
        // An untouched site covers everything.
        assert!(history.covers(site(1), Tick::ZERO, Tick::new(100)));
    }
}
