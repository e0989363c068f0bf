//! The transaction coordinator.
//!
//! Consumes one [`Command`] at a time, routes it through the placement
//! directory to the sites, and decides which transactions commit and which
//! abort:
//!
//! - read-write transactions run under strict two-phase locking with
//!   wait-die deadlock avoidance;
//! - read-only transactions read from the multiversion snapshot pinned at
//!   their start tick, with no locks;
//! - a site failure dooms every read-write transaction that accessed it,
//!   detected at `end`;
//! - operations that cannot make progress park on wake-up conditions and are
//!   re-driven in parking order while the command stream keeps moving.
//!
//! The coordinator is a single-threaded cooperative scheduler; "concurrency"
//! is the interleaving of operations from distinct transactions across
//! commands.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, info};

use repcrec_error::{RepcrecError, Result};
use repcrec_storage::SiteStore;
use repcrec_types::{AbortReason, Command, Outcome, SiteId, Tick, TxnId, TxnKind, TxnState, VariableId};

use crate::lock_table::Blockers;
use crate::multiversion::{MultiversionStore, SiteUpHistory};
use crate::parked::{Condition, ParkIndex};
use crate::placement::SiteDirectory;
use crate::site::{ReadLock, Site, WriteLock};
use crate::wait_graph::WaitForGraph;

// ---------------------------------------------------------------------------
// DatabaseConfig
// ---------------------------------------------------------------------------

/// Startup configuration for one coordinator instance.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// The placement policy.
    pub directory: SiteDirectory,
    /// Root of the per-site durable storage. Must not exist yet.
    pub data_path: PathBuf,
}

impl DatabaseConfig {
    /// Reference layout (10 sites, 20 variables) rooted at `data_path`.
    #[must_use]
    pub fn reference(data_path: impl Into<PathBuf>) -> Self {
        Self {
            directory: SiteDirectory::reference(),
            data_path: data_path.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Commit/abort log
// ---------------------------------------------------------------------------

/// One finalized transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub txn: TxnId,
    pub end_tick: Tick,
    pub outcome: Outcome,
    pub reason: Option<AbortReason>,
}

// ---------------------------------------------------------------------------
// Transaction records
// ---------------------------------------------------------------------------

/// A queued operation for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read(VariableId),
    Write(VariableId, i64),
    End,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(v) => write!(f, "read {v}"),
            Self::Write(v, value) => write!(f, "write {v} <- {value}"),
            Self::End => f.write_str("end"),
        }
    }
}

#[derive(Debug)]
struct TxnRecord {
    id: TxnId,
    kind: TxnKind,
    start: Tick,
    state: TxnState,
    end_received: bool,
    /// Head is the operation currently blocked (if any); later operations
    /// wait their turn, FIFO within the transaction.
    pending: VecDeque<Operation>,
    /// Last buffered value per variable, for read-your-writes and for
    /// multiversion publication at commit.
    writes: BTreeMap<VariableId, i64>,
    /// First successful access tick per site, for the end-of-transaction
    /// commit decision.
    sites_accessed: BTreeMap<SiteId, Tick>,
}

impl TxnRecord {
    fn new(id: TxnId, kind: TxnKind, start: Tick) -> Self {
        Self {
            id,
            kind,
            start,
            state: TxnState::Active,
            end_received: false,
            pending: VecDeque::new(),
            writes: BTreeMap::new(),
            sites_accessed: BTreeMap::new(),
        }
    }
}

/// Result of executing (or attempting) one operation.
enum Exec {
    /// Completed; the next pending operation may run.
    Done,
    /// Parked on a guard; the transaction is blocked.
    Parked,
    /// The transaction finalizes now.
    Finish(Finish),
}

enum Finish {
    Commit,
    Abort(AbortReason),
}

// ---------------------------------------------------------------------------
// TransactionManager
// ---------------------------------------------------------------------------

/// Coordinator over a fixed set of sites.
///
/// `W` receives the protocol output: the per-command echo log and dump
/// renderings. Diagnostics go through `tracing` instead.
#[derive(Debug)]
pub struct TransactionManager<W> {
    directory: SiteDirectory,
    sites: BTreeMap<SiteId, Site>,
    mvstore: MultiversionStore,
    up_history: SiteUpHistory,
    wait_graph: WaitForGraph,
    parked: ParkIndex,
    txns: HashMap<TxnId, TxnRecord>,
    log: Vec<LogEntry>,
    /// Conditions raised by the current command, drained by [`Self::pump`].
    fired: Vec<Condition>,
    tick: Tick,
    out: W,
}

impl<W: Write> TransactionManager<W> {
    /// Create the database: data directory, per-site stores with default
    /// values, and the initial multiversion snapshot at tick 0.
    ///
    /// # Errors
    ///
    /// [`RepcrecError::DataDirExists`] if the data directory is already
    /// present, plus any storage error from site initialization.
    pub fn new(config: DatabaseConfig, out: W) -> Result<Self> {
        if config.data_path.exists() {
            return Err(RepcrecError::DataDirExists {
                path: config.data_path,
            });
        }
        std::fs::create_dir_all(&config.data_path)?;

        let directory = config.directory;
        let mut sites = BTreeMap::new();
        for site_id in directory.site_ids() {
            let store = SiteStore::open(&config.data_path, site_id, &directory.defaults_at(site_id))?;
            sites.insert(site_id, Site::new(store));
        }
        let initial: BTreeMap<VariableId, i64> = directory
            .variable_ids()
            .map(|v| (v, v.default_value()))
            .collect();
        let up_history = SiteUpHistory::new(directory.site_ids());

        info!(
            sites = directory.site_count(),
            variables = directory.variable_count(),
            "database initialized"
        );
        Ok(Self {
            directory,
            sites,
            mvstore: MultiversionStore::new(initial),
            up_history,
            wait_graph: WaitForGraph::new(),
            parked: ParkIndex::new(),
            txns: HashMap::new(),
            log: Vec::new(),
            fired: Vec::new(),
            tick: Tick::ZERO,
            out,
        })
    }

    /// The placement policy in effect.
    #[must_use]
    pub fn directory(&self) -> &SiteDirectory {
        &self.directory
    }

    /// Current logical clock value.
    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// The ordered commit/abort log.
    #[must_use]
    pub fn commit_abort_log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Final outcome of `txn`, if it has one.
    #[must_use]
    pub fn outcome_of(&self, txn: TxnId) -> Option<Outcome> {
        self.log.iter().find(|e| e.txn == txn).map(|e| e.outcome)
    }

    /// Committed value of `variable` at `site`, for inspection.
    #[must_use]
    pub fn committed_value(&self, site: SiteId, variable: VariableId) -> Option<i64> {
        self.sites.get(&site)?.committed_values().get(&variable).copied()
    }

    /// Whether `site` is currently up.
    #[must_use]
    pub fn site_is_up(&self, site: SiteId) -> bool {
        self.sites.get(&site).is_some_and(Site::is_up)
    }

    /// Lifecycle state of an open transaction; `None` once finalized.
    #[must_use]
    pub fn txn_state(&self, txn: TxnId) -> Option<TxnState> {
        self.txns.get(&txn).map(|r| r.state)
    }

    /// A cycle in the wait-for graph, should one ever exist.
    #[must_use]
    pub fn wait_cycle(&self) -> Option<Vec<TxnId>> {
        self.wait_graph.find_cycle()
    }

    /// Process one command from the input stream.
    ///
    /// # Errors
    ///
    /// Input errors (unknown transaction/site/variable, duplicate begin or
    /// end) terminate the run. Operational aborts are not errors; they are
    /// recorded in the commit/abort log and processing continues.
    pub fn process(&mut self, command: Command) -> Result<()> {
        self.tick = self.tick.next();
        debug!(tick = %self.tick, %command, "processing");

        match command {
            Command::Begin(txn) => self.begin(txn, TxnKind::ReadWrite)?,
            Command::BeginRo(txn) => self.begin(txn, TxnKind::ReadOnly)?,
            Command::Read(txn, variable) => {
                self.check_variable(variable)?;
                self.submit(txn, Operation::Read(variable))?;
            }
            Command::Write(txn, variable, value) => {
                self.check_variable(variable)?;
                self.submit(txn, Operation::Write(variable, value))?;
            }
            Command::End(txn) => self.submit(txn, Operation::End)?,
            Command::Fail(site) => self.fail_site(site)?,
            Command::Recover(site) => self.recover_site(site)?,
            Command::DumpAll => self.dump_all()?,
            Command::DumpVariable(variable) => {
                self.check_variable(variable)?;
                self.dump_variable(variable)?;
            }
            Command::DumpSite(site) => {
                self.check_site(site)?;
                self.dump_site(site)?;
            }
        }
        self.pump()
    }

    // -----------------------------------------------------------------------
    // Command handlers
    // -----------------------------------------------------------------------

    fn begin(&mut self, txn: TxnId, kind: TxnKind) -> Result<()> {
        if self.txns.contains_key(&txn) || self.log.iter().any(|e| e.txn == txn) {
            return Err(RepcrecError::DuplicateTransaction { txn });
        }
        let start = self.tick;
        self.txns.insert(txn, TxnRecord::new(txn, kind, start));
        match kind {
            TxnKind::ReadWrite => self.echo(Some(txn), "started")?,
            TxnKind::ReadOnly => {
                let msg = format!("started read-only; snapshot pinned at {start}");
                self.echo(Some(txn), &msg)?;
            }
        }
        Ok(())
    }

    fn submit(&mut self, txn: TxnId, op: Operation) -> Result<()> {
        if !self.txns.contains_key(&txn) {
            // A transaction already finalized is acknowledged, not an error.
            if let Some(outcome) = self.outcome_of(txn) {
                let msg = format!("already {outcome}; ignoring {op}");
                return self.echo(Some(txn), &msg);
            }
            return Err(RepcrecError::UnknownTransaction { txn });
        }

        let rec = self.txns.get_mut(&txn).expect("checked above");
        if rec.kind == TxnKind::ReadOnly && matches!(op, Operation::Write(..)) {
            return Err(RepcrecError::ReadOnlyWrite { txn });
        }
        if matches!(op, Operation::End) {
            if rec.end_received {
                return Err(RepcrecError::DuplicateEnd { txn });
            }
            rec.end_received = true;
        }

        rec.pending.push_back(op);
        if rec.pending.len() == 1 {
            self.drive_txn(txn)?;
        }
        Ok(())
    }

    fn fail_site(&mut self, site_id: SiteId) -> Result<()> {
        self.check_site(site_id)?;
        let site = self.sites.get_mut(&site_id).expect("checked above");
        if !site.is_up() {
            return Err(RepcrecError::SiteAlreadyDown { site: site_id });
        }
        site.fail();
        self.up_history.record_down(site_id, self.tick);
        self.echo(None, &format!("site {site_id} is down"))?;

        // Lock waits at this site can never be granted there; re-drive them
        // so they retry elsewhere or park on recovery.
        let ready = self.parked.fire_site_locks(site_id);
        for txn in ready {
            self.drive_txn(txn)?;
        }
        Ok(())
    }

    fn recover_site(&mut self, site_id: SiteId) -> Result<()> {
        self.check_site(site_id)?;
        let site = self.sites.get_mut(&site_id).expect("checked above");
        if site.is_up() {
            return Err(RepcrecError::SiteNotDown { site: site_id });
        }
        site.recover(self.tick);
        self.up_history.record_up(site_id, self.tick);
        self.echo(
            None,
            &format!("site {site_id} is up; replicated copies stale until written"),
        )?;

        let ready = self.parked.fire(&[Condition::SiteUp(site_id)]);
        for txn in ready {
            self.drive_txn(txn)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operation driving
    // -----------------------------------------------------------------------

    /// Run `txn`'s pending operations until one parks, the queue drains, or
    /// the transaction finalizes.
    fn drive_txn(&mut self, txn: TxnId) -> Result<()> {
        let Some(mut rec) = self.txns.remove(&txn) else {
            return Ok(());
        };
        while let Some(op) = rec.pending.front().copied() {
            match self.exec_op(&mut rec, op)? {
                Exec::Done => {
                    rec.state = TxnState::Active;
                    rec.pending.pop_front();
                }
                Exec::Parked => {
                    self.txns.insert(txn, rec);
                    return Ok(());
                }
                Exec::Finish(finish) => {
                    return self.finalize(rec, finish);
                }
            }
        }
        self.txns.insert(txn, rec);
        Ok(())
    }

    fn exec_op(&mut self, rec: &mut TxnRecord, op: Operation) -> Result<Exec> {
        match op {
            Operation::Read(variable) => match rec.kind {
                TxnKind::ReadWrite => self.exec_read_rw(rec, variable),
                TxnKind::ReadOnly => self.exec_read_ro(rec, variable),
            },
            Operation::Write(variable, value) => self.exec_write(rec, variable, value),
            Operation::End => self.exec_end(rec),
        }
    }

    /// Read under strict two-phase locking: lowest-id up, non-stale replica.
    fn exec_read_rw(&mut self, rec: &mut TxnRecord, variable: VariableId) -> Result<Exec> {
        // Read-your-writes: the transaction already holds exclusive locks on
        // every up replica, and its buffered value is newer than any
        // committed copy.
        if let Some(&value) = rec.writes.get(&variable) {
            let msg = format!("read {variable} -> {value} from its own pending write");
            self.echo(Some(rec.id), &msg)?;
            return Ok(Exec::Done);
        }

        let hosting = self.directory.sites_for(variable);
        for site_id in &hosting {
            let site = self.sites.get_mut(site_id).expect("directory site exists");
            if !site.is_up() {
                continue;
            }
            match site.read_lock(rec.id, variable) {
                ReadLock::Granted => {
                    let value = site.read_committed(rec.id, variable);
                    self.note_access(rec, *site_id);
                    self.wait_graph.clear_waiter(rec.id);
                    let msg = format!("read {variable} -> {value} from site {site_id}");
                    self.echo(Some(rec.id), &msg)?;
                    return Ok(Exec::Done);
                }
                ReadLock::Wait(blockers) => {
                    let guard = vec![Condition::LockReleased {
                        site: *site_id,
                        variable,
                    }];
                    let action = format!("reading {variable}");
                    return self.block_or_die(rec, &blockers, guard, &action);
                }
                ReadLock::Stale | ReadLock::Down => {}
            }
        }

        // No replica is both up and readable: park until one recovers or a
        // committed write clears staleness somewhere. The wait is on site
        // state, not on any transaction.
        let mut guard: Vec<Condition> = hosting.iter().map(|&s| Condition::SiteUp(s)).collect();
        guard.push(Condition::CommittedWrite(variable));
        self.wait_graph.clear_waiter(rec.id);
        rec.state = TxnState::Blocked;
        self.parked.park(rec.id, guard);
        let msg = format!("waiting to read {variable}; no readable copy");
        self.echo(Some(rec.id), &msg)?;
        Ok(Exec::Parked)
    }

    /// Read-only snapshot read, validated against site up-history for
    /// replicated variables.
    fn exec_read_ro(&mut self, rec: &mut TxnRecord, variable: VariableId) -> Result<Exec> {
        let start = rec.start;
        let value = self
            .mvstore
            .value_at(variable, start)
            .expect("placement covers every variable");

        if variable.is_replicated() {
            let committed_at = self.mvstore.last_commit_of(variable, start);
            let covered = self
                .directory
                .sites_for(variable)
                .iter()
                .any(|&s| self.up_history.covers(s, committed_at, start));
            if !covered {
                let msg = format!(
                    "no site held {variable} continuously from its commit at {committed_at}"
                );
                self.echo(Some(rec.id), &msg)?;
                return Ok(Exec::Finish(Finish::Abort(
                    AbortReason::ReadOnlyUnavailableHistory,
                )));
            }
        }

        let msg = format!("read {variable} -> {value} from the snapshot at {start}");
        self.echo(Some(rec.id), &msg)?;
        Ok(Exec::Done)
    }

    /// Write: exclusive locks on every up replica, buffered once all grant.
    fn exec_write(&mut self, rec: &mut TxnRecord, variable: VariableId, value: i64) -> Result<Exec> {
        let hosting = self.directory.sites_for(variable);
        let mut up_sites = Vec::new();
        let mut blockers = Blockers::new();
        let mut conflicted = Vec::new();

        for site_id in &hosting {
            let site = self.sites.get_mut(site_id).expect("directory site exists");
            if !site.is_up() {
                continue;
            }
            up_sites.push(*site_id);
            match site.write_lock(rec.id, variable) {
                WriteLock::Granted => {}
                WriteLock::Wait(site_blockers) => {
                    conflicted.push(*site_id);
                    for b in site_blockers {
                        if !blockers.contains(&b) {
                            blockers.push(b);
                        }
                    }
                }
                WriteLock::Down => {}
            }
        }

        if up_sites.is_empty() {
            let guard = hosting.iter().map(|&s| Condition::SiteUp(s)).collect();
            self.wait_graph.clear_waiter(rec.id);
            rec.state = TxnState::Blocked;
            self.parked.park(rec.id, guard);
            let msg = format!("waiting to write {variable}; no site is up");
            self.echo(Some(rec.id), &msg)?;
            return Ok(Exec::Parked);
        }

        if !blockers.is_empty() {
            // Locks granted so far stay held; the retry re-requests them
            // idempotently.
            let guard = conflicted
                .into_iter()
                .map(|s| Condition::LockReleased { site: s, variable })
                .collect();
            let action = format!("writing {variable}");
            return self.block_or_die(rec, &blockers, guard, &action);
        }

        for site_id in &up_sites {
            let site = self.sites.get_mut(site_id).expect("directory site exists");
            site.buffer_write(rec.id, variable, value);
            self.note_access(rec, *site_id);
        }
        rec.writes.insert(variable, value);
        self.wait_graph.clear_waiter(rec.id);

        let written: Vec<String> = up_sites.iter().map(ToString::to_string).collect();
        let msg = format!(
            "write {variable} <- {value} at sites {{{}}}",
            written.join(", ")
        );
        self.echo(Some(rec.id), &msg)?;
        Ok(Exec::Done)
    }

    /// Commit decision at `end`.
    fn exec_end(&mut self, rec: &mut TxnRecord) -> Result<Exec> {
        if rec.kind == TxnKind::ReadOnly {
            return Ok(Exec::Finish(Finish::Commit));
        }
        for (&site_id, &first_access) in &rec.sites_accessed {
            let site = &self.sites[&site_id];
            if !site.is_up() {
                let msg = format!("aborting; accessed site {site_id} is down");
                self.echo(Some(rec.id), &msg)?;
                return Ok(Exec::Finish(Finish::Abort(AbortReason::SiteDownDuringAccess)));
            }
            if site.up_since() > first_access {
                let msg = format!("aborting; site {site_id} went down after first access");
                self.echo(Some(rec.id), &msg)?;
                return Ok(Exec::Finish(Finish::Abort(AbortReason::SiteDownDuringAccess)));
            }
        }
        Ok(Exec::Finish(Finish::Commit))
    }

    /// Apply wait-die to a blocked request: an older transaction waits, a
    /// younger one dies on the spot.
    fn block_or_die(
        &mut self,
        rec: &mut TxnRecord,
        blockers: &Blockers,
        guard: Vec<Condition>,
        action: &str,
    ) -> Result<Exec> {
        let oldest = blockers
            .iter()
            .filter_map(|b| self.txns.get(b).map(|r| (r.start, r.id)))
            .min();
        let Some((oldest_start, oldest_id)) = oldest else {
            // Blockers finalized between observation and decision; re-park
            // and let the pending lock release re-drive the operation.
            debug_assert!(false, "blockers vanished for {}", rec.id);
            rec.state = TxnState::Blocked;
            self.parked.park(rec.id, guard);
            return Ok(Exec::Parked);
        };

        if rec.start > oldest_start {
            let msg = format!("killed by wait-die; {action} conflicts with older {oldest_id}");
            self.echo(Some(rec.id), &msg)?;
            return Ok(Exec::Finish(Finish::Abort(AbortReason::WaitDie)));
        }

        self.wait_graph.clear_waiter(rec.id);
        for &blocker in blockers {
            self.wait_graph.add_edge(rec.id, blocker);
        }
        debug_assert!(
            self.wait_graph.find_cycle().is_none(),
            "wait-die admitted a wait cycle"
        );
        rec.state = TxnState::Blocked;
        self.parked.park(rec.id, guard);
        let msg = format!("blocked by {oldest_id} {action}");
        self.echo(Some(rec.id), &msg)?;
        Ok(Exec::Parked)
    }

    /// Record the first successful access tick at a site.
    fn note_access(&mut self, rec: &mut TxnRecord, site: SiteId) {
        rec.sites_accessed.entry(site).or_insert(self.tick);
    }

    // -----------------------------------------------------------------------
    // Finalization and wake-up
    // -----------------------------------------------------------------------

    fn finalize(&mut self, mut rec: TxnRecord, finish: Finish) -> Result<()> {
        let site_ids: Vec<SiteId> = self.sites.keys().copied().collect();
        match finish {
            Finish::Commit => {
                // Commit time is the next monotonic tick; two commits can
                // cascade from one input command and must not share one.
                self.tick = self.tick.next();
                let commit_time = self.tick;

                for site_id in site_ids {
                    let site = self.sites.get_mut(&site_id).expect("site exists");
                    if !site.is_up() {
                        continue;
                    }
                    let promoted = site.commit(rec.id)?;
                    for grant in promoted {
                        self.fired.push(Condition::LockReleased {
                            site: site_id,
                            variable: grant.variable,
                        });
                    }
                }

                if !rec.writes.is_empty() {
                    self.mvstore.publish(commit_time, &rec.writes);
                    for &variable in rec.writes.keys() {
                        self.fired.push(Condition::CommittedWrite(variable));
                    }
                }

                rec.state = TxnState::Committed;
                self.log.push(LogEntry {
                    txn: rec.id,
                    end_tick: commit_time,
                    outcome: Outcome::Committed,
                    reason: None,
                });
                info!(txn = %rec.id, %commit_time, writes = rec.writes.len(), "committed");
                self.echo(Some(rec.id), "committed")?;
            }
            Finish::Abort(reason) => {
                for site_id in site_ids {
                    let site = self.sites.get_mut(&site_id).expect("site exists");
                    if !site.is_up() {
                        continue;
                    }
                    for grant in site.abort(rec.id) {
                        self.fired.push(Condition::LockReleased {
                            site: site_id,
                            variable: grant.variable,
                        });
                    }
                }

                rec.state = TxnState::Aborted;
                self.log.push(LogEntry {
                    txn: rec.id,
                    end_tick: self.tick,
                    outcome: Outcome::Aborted,
                    reason: Some(reason),
                });
                info!(txn = %rec.id, %reason, "aborted");
                let msg = format!("aborted ({reason})");
                self.echo(Some(rec.id), &msg)?;
            }
        }
        self.wait_graph.remove_txn(rec.id);
        self.parked.unpark(rec.id);
        Ok(())
    }

    /// Drain raised conditions, re-driving woken transactions in parking
    /// order, until the system is quiet.
    fn pump(&mut self) -> Result<()> {
        while !self.fired.is_empty() {
            let batch: Vec<Condition> = self.fired.drain(..).collect();
            let ready = self.parked.fire(&batch);
            for txn in ready {
                self.drive_txn(txn)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dumps and output
    // -----------------------------------------------------------------------

    /// `dump()`: committed state of every site, in site order. Repeated
    /// dumps without intervening state changes are byte-identical, so no
    /// tick prefix appears here.
    fn dump_all(&mut self) -> Result<()> {
        for site_id in self.directory.site_ids().collect::<Vec<_>>() {
            self.dump_line(site_id, None)?;
        }
        Ok(())
    }

    fn dump_variable(&mut self, variable: VariableId) -> Result<()> {
        for site_id in self.directory.sites_for(variable) {
            self.dump_line(site_id, Some(variable))?;
        }
        Ok(())
    }

    fn dump_site(&mut self, site_id: SiteId) -> Result<()> {
        self.dump_line(site_id, None)
    }

    fn dump_line(&mut self, site_id: SiteId, only: Option<VariableId>) -> Result<()> {
        let site = &self.sites[&site_id];
        let up = site.is_up();
        let parts: Vec<String> = site
            .committed_values()
            .iter()
            .filter(|(&v, _)| only.is_none_or(|o| o == v))
            .map(|(&v, &value)| {
                let star = if up && site.is_stale(v) { "*" } else { "" };
                format!("{v}={value}{star}")
            })
            .collect();
        let marker = if up { "" } else { " (down)" };
        writeln!(self.out, "S{site_id}{marker}: {}", parts.join(" "))?;
        Ok(())
    }

    /// One protocol-output line, prefixed with the current tick and the
    /// owning transaction (or `--` for site/stream events).
    fn echo(&mut self, txn: Option<TxnId>, msg: &str) -> Result<()> {
        let tick = self.tick.to_string();
        match txn {
            Some(t) => {
                let label = t.to_string();
                writeln!(self.out, "{tick:<5} {label:>4} : {msg}")?;
            }
            None => writeln!(self.out, "{tick:<5}   -- : {msg}")?,
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Input validation
    // -----------------------------------------------------------------------

    fn check_variable(&self, variable: VariableId) -> Result<()> {
        if self.directory.contains_variable(variable) {
            Ok(())
        } else {
            Err(RepcrecError::UnknownVariable {
                index: variable.index(),
            })
        }
    }

    fn check_site(&self, site: SiteId) -> Result<()> {
        if self.directory.contains_site(site) {
            Ok(())
        } else {
            Err(RepcrecError::UnknownSite { site })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(n: u32) -> TxnId {
        TxnId::new(n).unwrap()
    }

    fn var(n: u32) -> VariableId {
        VariableId::new(n).unwrap()
    }

    fn site(n: u32) -> SiteId {
        SiteId::new(n).unwrap()
    }

    fn manager() -> (tempfile::TempDir, TransactionManager<Vec<u8>>) {
        let root = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::reference(root.path().join("db"));
        let tm = TransactionManager::new(config, Vec::new()).unwrap();
        (root, tm)
    }

    fn run(tm: &mut TransactionManager<Vec<u8>>, commands: &[Command]) {
        for &c in commands {
            tm.process(c).unwrap();
        }
    }

    #[test]
    fn data_dir_must_not_exist() {
        let root = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::reference(root.path());
        let err = TransactionManager::new(config, Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, RepcrecError::DataDirExists { .. }));
    }

    #[test]
    fn write_then_commit_installs_everywhere() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Write(txn(1), var(2), 55),
                Command::End(txn(1)),
            ],
        );
        assert_eq!(tm.outcome_of(txn(1)), Some(Outcome::Committed));
        for s in 1..=10 {
            assert_eq!(tm.committed_value(site(s), var(2)), Some(55));
        }
    }

    #[test]
    fn read_your_writes() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Write(txn(1), var(3), 77),
                Command::Read(txn(1), var(3)),
            ],
        );
        let output = String::from_utf8(tm.out.clone()).unwrap();
        assert!(output.contains("read x3 -> 77"), "output: {output}");
    }

    #[test]
    fn wait_die_kills_younger_reader() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Begin(txn(2)),
                Command::Write(txn(1), var(1), 5),
                Command::Read(txn(2), var(1)),
            ],
        );
        assert_eq!(tm.outcome_of(txn(2)), Some(Outcome::Aborted));
        let entry = tm.commit_abort_log().last().unwrap();
        assert_eq!(entry.reason, Some(AbortReason::WaitDie));
    }

    #[test]
    fn older_reader_waits_and_resumes_after_commit() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Begin(txn(2)),
                Command::Write(txn(2), var(1), 15),
                Command::Read(txn(1), var(1)),
                Command::End(txn(2)),
                Command::End(txn(1)),
            ],
        );
        assert_eq!(tm.outcome_of(txn(2)), Some(Outcome::Committed));
        assert_eq!(tm.outcome_of(txn(1)), Some(Outcome::Committed));
        let output = String::from_utf8(tm.out.clone()).unwrap();
        // T1's parked read resumed after T2's commit and saw the new value.
        assert!(output.contains("read x1 -> 15"), "output: {output}");
    }

    #[test]
    fn site_failure_dooms_writers_at_end() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Write(txn(1), var(1), 81),
                Command::Fail(site(2)),
                Command::End(txn(1)),
            ],
        );
        assert_eq!(tm.outcome_of(txn(1)), Some(Outcome::Aborted));
        let entry = tm.commit_abort_log().last().unwrap();
        assert_eq!(entry.reason, Some(AbortReason::SiteDownDuringAccess));
        // The aborted write never reached the store.
        run(&mut tm, &[Command::Recover(site(2))]);
        assert_eq!(tm.committed_value(site(2), var(1)), Some(10));
    }

    #[test]
    fn read_only_sees_pinned_snapshot() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::BeginRo(txn(1)),
                Command::Begin(txn(2)),
                Command::Write(txn(2), var(2), 99),
                Command::End(txn(2)),
                Command::Read(txn(1), var(2)),
                Command::End(txn(1)),
            ],
        );
        assert_eq!(tm.outcome_of(txn(1)), Some(Outcome::Committed));
        let output = String::from_utf8(tm.out.clone()).unwrap();
        // T2 committed after T1's snapshot; T1 still sees the default.
        assert!(output.contains("read x2 -> 20"), "output: {output}");
    }

    #[test]
    fn stale_replica_is_skipped_after_recovery() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Fail(site(1)),
                Command::Recover(site(1)),
                Command::Begin(txn(1)),
                Command::Read(txn(1), var(4)),
            ],
        );
        let output = String::from_utf8(tm.out.clone()).unwrap();
        // Site 1 is stale for x4, so the read lands on site 2.
        assert!(output.contains("read x4 -> 40 from site 2"), "output: {output}");
    }

    #[test]
    fn commands_for_finalized_transactions_are_ignored() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Begin(txn(2)),
                Command::Write(txn(1), var(1), 5),
                Command::Read(txn(2), var(1)), // killed by wait-die
                Command::Read(txn(2), var(2)), // ignored
            ],
        );
        let output = String::from_utf8(tm.out.clone()).unwrap();
        assert!(output.contains("ignoring read x2"), "output: {output}");
    }

    #[test]
    fn blocked_transactions_report_their_state() {
        let (_root, mut tm) = manager();
        run(
            &mut tm,
            &[
                Command::Begin(txn(1)),
                Command::Begin(txn(2)),
                Command::Write(txn(2), var(1), 9),
                Command::Read(txn(1), var(1)),
            ],
        );
        assert_eq!(tm.txn_state(txn(1)), Some(TxnState::Blocked));
        assert_eq!(tm.txn_state(txn(2)), Some(TxnState::Active));

        run(&mut tm, &[Command::End(txn(2)), Command::End(txn(1))]);
        assert_eq!(tm.txn_state(txn(1)), None);
        assert_eq!(tm.outcome_of(txn(1)), Some(Outcome::Committed));
    }

    #[test]
    fn duplicate_begin_is_an_input_error() {
        let (_root, mut tm) = manager();
        run(&mut tm, &[Command::Begin(txn(1))]);
        let err = tm.process(Command::Begin(txn(1))).unwrap_err();
        assert!(matches!(err, RepcrecError::DuplicateTransaction { .. }));
    }

    #[test]
    fn dump_is_idempotent() {
        let (_root, mut tm) = manager();
        run(&mut tm, &[Command::DumpAll]);
        let first = tm.out.clone();
        tm.out.clear();
        run(&mut tm, &[Command::DumpAll]);
        assert_eq!(first, tm.out);
        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("S1: x2=20"), "dump: {text}");
    }
}
