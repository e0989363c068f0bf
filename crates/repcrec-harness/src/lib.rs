//! RepCRec verification harness.
//!
//! Turns script text into [`repcrec_types::Command`] streams, drives a
//! coordinator through them, evaluates the `assertCommitted`/`assertAborted`
//! section, and produces a machine-readable [`RunReport`].

pub mod runner;
pub mod script;

pub use runner::{AssertionResult, RunReport, run_script};
pub use script::{Assertion, TestScript};
