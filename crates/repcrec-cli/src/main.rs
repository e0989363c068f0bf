//! RepCRec script runner.
//!
//! Reads a command script (file or stdin), runs it against a fresh database,
//! prints the protocol output, and evaluates any assertion section.
//!
//! Exit codes: 0 when the run succeeds and all assertions pass, 1 when an
//! assertion fails, 2 on input/configuration/storage errors.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use repcrec::{DatabaseConfig, SiteDirectory};
use repcrec_error::Result;
use repcrec_harness::{RunReport, TestScript, run_script};

#[derive(Debug, Parser)]
#[command(name = "repcrec", about = "Replicated concurrency control and recovery")]
struct Args {
    /// Script file to run; reads stdin when omitted.
    script: Option<PathBuf>,

    /// Root directory for per-site durable storage. Must not exist yet.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Number of storage sites.
    #[arg(long, default_value_t = 10)]
    sites: u32,

    /// Number of variables (x1..xN).
    #[arg(long, default_value_t = 20)]
    variables: u32,

    /// Write the machine-readable run report as JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match run(&Args::parse()) {
        Ok(report) => match report.check() {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{err}");
                ExitCode::from(1)
            }
        },
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> Result<RunReport> {
    let script = match &args.script {
        Some(path) => TestScript::load(path)?,
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            TestScript::parse(&text)?
        }
    };

    let config = DatabaseConfig {
        directory: SiteDirectory::new(args.sites, args.variables)?,
        data_path: args.data_dir.clone(),
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let report = run_script(&script, config, &mut out)?;

    if let Some(path) = &args.report {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, &report).map_err(io::Error::other)?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_match_reference_configuration() {
        let args = Args::parse_from(["repcrec", "script.txt"]);
        assert_eq!(args.sites, 10);
        assert_eq!(args.variables, 20);
        assert_eq!(args.data_dir, PathBuf::from("data"));
    }
}
