//! `vardelay-run`: run one variable-delay test from a prepared output
//! directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use vardelay_runner::{RunOptions, TestController};

/// Runs the flows described by `<dir>/metadata.json` over a namespace
/// dumbbell and records one capture per flow endpoint into `<dir>`.
#[derive(Parser, Debug)]
#[command(name = "vardelay-run", about = "Variable-delay congestion-control testbed")]
struct Cli {
    /// Output directory holding metadata.json.
    #[arg(long)]
    dir: PathBuf,

    /// Pantheon checkout with the scheme wrappers.
    #[arg(long)]
    pantheon: PathBuf,

    /// Run schemes and captures as this user.
    #[arg(long)]
    user: Option<String>,

    /// Prefix of every network namespace created for the run.
    #[arg(long, default_value = "vd")]
    namespace_prefix: String,
}

fn install_stop_handler(stop: Arc<AtomicBool>) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nReceived interrupt, stopping the run...");
        stop.store(true, Ordering::Relaxed);
    })
    .context("failed to install the interrupt handler")
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    tracing::info!(
        dir = %cli.dir.display(),
        pantheon = %cli.pantheon.display(),
        user = ?cli.user,
        prefix = %cli.namespace_prefix,
        "vardelay-run starting"
    );

    let stop = Arc::new(AtomicBool::new(false));
    if let Err(e) = install_stop_handler(stop.clone()) {
        tracing::warn!(error = %e, "continuing without interrupt handling");
    }

    let options = RunOptions {
        dir: cli.dir,
        pantheon: cli.pantheon,
        user: cli.user,
        namespace_prefix: cli.namespace_prefix,
    };
    match TestController::prepare(options, stop).and_then(TestController::run) {
        Ok(report) => {
            tracing::info!(dropped = report.total(), "captures complete");
            println!("SUCCESS");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} ERROR: {e}", e.kind());
            println!("FAILURE");
            ExitCode::FAILURE
        }
    }
}
