//! Segtrain CLI - trains segmentation networks and inspects their runs.
//!
//! `segtrain train` starts or resumes a run; `segtrain history` prints the
//! validation history a run has recorded so far.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use commands::{history, train};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Segtrain - resumable training of pixel-wise segmentation networks
#[derive(Parser, Debug)]
#[command(name = "segtrain", author, version, about = "Resumable training of pixel-wise segmentation networks")]
struct Args {
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a network, optionally resuming from an earlier run
    Train(train::TrainArgs),

    /// Print the validation history of a run directory
    History(history::HistoryArgs),
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so that --json output stays parseable.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().without_time().with_target(false).with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::Train(train_args) => train::execute(train_args),
        Command::History(history_args) => history::execute(&history_args),
    }
}
