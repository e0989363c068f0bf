//! Primary error type for RepCRec operations.
//!
//! Structured variants for the failure classes the system distinguishes:
//! malformed input terminates a run, configuration problems prevent startup,
//! storage faults surface the underlying I/O error. Transaction aborts are
//! *not* errors — they are recorded outcomes in the coordinator's
//! commit/abort log and never travel through this enum.

use std::path::PathBuf;

use thiserror::Error;

use repcrec_types::{SiteId, TxnId};

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, RepcrecError>;

#[derive(Error, Debug)]
pub enum RepcrecError {
    // === Input errors (terminate the run) ===
    /// Malformed command text.
    #[error("line {line}: cannot parse command: {detail}")]
    ScriptParse { line: usize, detail: String },

    /// Command name not in the grammar.
    #[error("line {line}: unknown command '{name}'")]
    UnknownCommand { line: usize, name: String },

    /// Transaction referenced before `begin`/`beginRO`, or after its `end`.
    #[error("{txn} is not active")]
    UnknownTransaction { txn: TxnId },

    /// `begin`/`beginRO` for a transaction id already open.
    #[error("cannot begin {txn}; already started")]
    DuplicateTransaction { txn: TxnId },

    /// A second `end` for a transaction that already received one.
    #[error("{txn} ended already")]
    DuplicateEnd { txn: TxnId },

    /// `W` command for a read-only transaction.
    #[error("{txn} is read-only; writes are not permitted")]
    ReadOnlyWrite { txn: TxnId },

    /// Variable index outside the configured `x1..xN` space.
    #[error("variable x{index} is not in the database")]
    UnknownVariable { index: u32 },

    /// Site index outside the configured `1..S` space.
    #[error("site {site} does not exist")]
    UnknownSite { site: SiteId },

    /// `fail` on a site that is already down.
    #[error("site {site} is already down")]
    SiteAlreadyDown { site: SiteId },

    /// `recover` on a site that is up.
    #[error("site {site} is not down")]
    SiteNotDown { site: SiteId },

    // === Configuration errors ===
    /// The data directory must not exist before first use.
    #[error("data directory already exists: '{path}'")]
    DataDirExists { path: PathBuf },

    /// Invalid site or variable count.
    #[error("invalid layout: {detail}")]
    InvalidLayout { detail: String },

    // === Storage errors ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A site data file holds something other than a decimal integer.
    #[error("corrupt value in '{path}': {detail}")]
    CorruptValue { path: PathBuf, detail: String },

    // === Harness errors ===
    /// One or more script assertions failed.
    #[error("{failed} of {total} assertions failed")]
    AssertionFailure { failed: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = RepcrecError::DuplicateTransaction {
            txn: TxnId::new(3).unwrap(),
        };
        assert_eq!(err.to_string(), "cannot begin T3; already started");

        let err = RepcrecError::UnknownVariable { index: 42 };
        assert_eq!(err.to_string(), "variable x42 is not in the database");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: RepcrecError = io.into();
        assert!(matches!(err, RepcrecError::Io(_)));
    }
}
