//! Transaction-level wait-for graph.
//!
//! Edges run from a blocked transaction to the transactions blocking it.
//! Under wait-die the graph can never contain a cycle; [`WaitForGraph::find_cycle`]
//! exists as a defensive check exercised after every block.

use std::collections::{BTreeMap, BTreeSet};

use repcrec_types::TxnId;

/// Adjacency map over transaction ids.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl WaitForGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` waits for `holder`.
    pub fn add_edge(&mut self, waiter: TxnId, holder: TxnId) {
        debug_assert_ne!(waiter, holder, "self wait edge");
        self.edges.entry(waiter).or_default().insert(holder);
    }

    /// The transactions `waiter` currently waits for.
    #[must_use]
    pub fn waits_of(&self, waiter: TxnId) -> Option<&BTreeSet<TxnId>> {
        self.edges.get(&waiter)
    }

    /// Drop the outgoing edges of `waiter` (it resumed or re-parks with a
    /// fresh blocker set).
    pub fn clear_waiter(&mut self, waiter: TxnId) {
        self.edges.remove(&waiter);
    }

    /// Drop every edge involving `txn`, in either direction (it ended).
    pub fn remove_txn(&mut self, txn: TxnId) {
        self.edges.remove(&txn);
        for targets in self.edges.values_mut() {
            targets.remove(&txn);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Depth-first search for a cycle; returns the transactions on one if
    /// found. Wait-die makes this unreachable in normal operation.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut visited = BTreeSet::new();
        for &start in self.edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(path);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TxnId,
        visited: &mut BTreeSet<TxnId>,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
    ) -> bool {
        if on_path.contains(&node) {
            // Trim the prefix that is not part of the cycle.
            let start = path.iter().position(|&t| t == node).unwrap_or(0);
            path.drain(..start);
            return true;
        }
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        on_path.insert(node);
        if let Some(targets) = self.edges.get(&node) {
            for &next in targets {
                if self.dfs(next, visited, path, on_path) {
                    return true;
                }
            }
        }
        path.pop();
        on_path.remove(&node);
        false
    }
}
