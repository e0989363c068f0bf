//! Drive a coordinator through a parsed script and check its assertions.

use std::io::Write;

use tracing::info;

use repcrec::{DatabaseConfig, LogEntry, TransactionManager};
use repcrec_error::{RepcrecError, Result};
use repcrec_types::Outcome;

use crate::script::{Assertion, TestScript};

/// One evaluated assertion.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssertionResult {
    pub assertion: Assertion,
    pub passed: bool,
    pub detail: String,
}

/// Machine-readable result of a script run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunReport {
    pub commit_abort_log: Vec<LogEntry>,
    pub assertions: Vec<AssertionResult>,
}

impl RunReport {
    /// Whether every assertion passed (vacuously true without assertions).
    #[must_use]
    pub fn passed(&self) -> bool {
        self.assertions.iter().all(|a| a.passed)
    }

    /// Number of failed assertions.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.assertions.iter().filter(|a| !a.passed).count()
    }

    /// Turn assertion failures into the harness error.
    ///
    /// # Errors
    ///
    /// [`RepcrecError::AssertionFailure`] when any assertion failed.
    pub fn check(&self) -> Result<()> {
        let failed = self.failed();
        if failed == 0 {
            Ok(())
        } else {
            Err(RepcrecError::AssertionFailure {
                failed,
                total: self.assertions.len(),
            })
        }
    }
}

/// Run `script` against a fresh database, writing protocol output and
/// `debug`-prefixed assertion results to `out`.
///
/// Assertion failures are reported in the returned [`RunReport`], not as
/// errors; input and configuration problems terminate the run as errors.
///
/// # Errors
///
/// Any coordinator error: malformed references in the command stream,
/// configuration problems, or storage I/O failure.
pub fn run_script<W: Write>(
    script: &TestScript,
    config: DatabaseConfig,
    out: &mut W,
) -> Result<RunReport> {
    let mut manager = TransactionManager::new(config, &mut *out)?;
    for &command in script.commands() {
        manager.process(command)?;
    }
    let commit_abort_log = manager.commit_abort_log().to_vec();
    drop(manager);

    let mut results = Vec::with_capacity(script.assertions().len());
    for &assertion in script.assertions() {
        let result = evaluate(assertion, &commit_abort_log);
        let status = if result.passed { "SUCCESS" } else { "FAILURE" };
        writeln!(out, "debug {status} : {}", result.detail)?;
        results.push(result);
    }

    let report = RunReport {
        commit_abort_log,
        assertions: results,
    };
    info!(
        finalized = report.commit_abort_log.len(),
        assertions = report.assertions.len(),
        failed = report.failed(),
        "script run finished"
    );
    Ok(report)
}

fn evaluate(assertion: Assertion, log: &[LogEntry]) -> AssertionResult {
    let txn = assertion.txn();
    let expected = match assertion {
        Assertion::Committed(_) => Outcome::Committed,
        Assertion::Aborted(_) => Outcome::Aborted,
    };
    let expected_name = match expected {
        Outcome::Committed => "COMMITTED",
        Outcome::Aborted => "ABORTED",
    };

    match log.iter().find(|e| e.txn == txn) {
        Some(entry) => AssertionResult {
            assertion,
            passed: entry.outcome == expected,
            detail: format!("expecting {expected_name} for {txn}"),
        },
        None => AssertionResult {
            assertion,
            passed: false,
            detail: format!("{txn} not found in the log"),
        },
    }
}
