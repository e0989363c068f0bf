//! RepCRec: replicated concurrency control and recovery.
//!
//! A teaching-grade distributed database over a fixed set of co-located
//! storage sites. This crate is the core: the placement directory, per-site
//! lock tables and recovery state, the multiversion snapshot store consulted
//! by read-only transactions, the wait-for graph, and the single-threaded
//! transaction coordinator that drives them from a command stream.
//!
//! Command parsing and the assertion harness live in `repcrec-harness`;
//! durable per-site storage lives in `repcrec-storage`.

pub mod coordinator;
pub mod lock_table;
pub mod multiversion;
pub mod parked;
pub mod placement;
pub mod site;
pub mod wait_graph;

pub use coordinator::{DatabaseConfig, LogEntry, TransactionManager};
pub use lock_table::{Acquire, Blockers, LockTable, PromotedGrant};
pub use multiversion::{MultiversionStore, SiteUpHistory, SnapshotRecord};
pub use parked::{Condition, ParkIndex};
pub use placement::SiteDirectory;
pub use site::{ReadLock, Site, SiteStatus, WriteLock};
pub use wait_graph::WaitForGraph;
