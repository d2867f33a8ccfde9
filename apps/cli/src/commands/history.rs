//! Prints the metric history of a run directory.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use segtrain_training::{BestModelPolicy, MetricHistory, RunLayout};
use serde_json::json;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Run directory
    pub path_model: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: &HistoryArgs) -> Result<()> {
    let layout = RunLayout::new(&args.path_model);
    let history = MetricHistory::load(&layout.history_path())
        .with_context(|| format!("Failed to read the history of {}", args.path_model.display()))?;
    let policy = BestModelPolicy::replay(history.records());

    if args.json {
        let out = json!({
            "records": history.records(),
            "best": policy.best(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Validation history ({} epochs)", history.len()).bold().cyan());
    println!();
    if history.is_empty() {
        println!("  {}", "No epoch has completed yet.".dimmed());
        println!();
        return Ok(());
    }

    let best_epoch = policy.best().map(|b| b.epoch);
    println!("{:<8} {:<12} {}", "Epoch", "Loss", "Accuracy");
    println!("{}", "─".repeat(32));
    for record in history.records() {
        let line = format!("{:<8} {:<12.6} {:.6}", record.epoch, record.loss, record.accuracy);
        if Some(record.epoch) == best_epoch {
            println!("{}", line.green());
        } else {
            println!("{line}");
        }
    }
    println!();
    Ok(())
}
