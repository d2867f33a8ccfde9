//! Training command implementation.

use crate::config::{default_config_path, load_training_config};
use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use segtrain_models::{DirectoryDatasetLoader, PixelConvNetBuilder};
use segtrain_training::{Device, RunOptions, TrainingRequest, train_model};
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Training set root holding `train/` and `validation/`
    #[arg(short = 'p', long)]
    pub path_training: PathBuf,

    /// Output directory of the run
    #[arg(short = 'm', long)]
    pub path_model: PathBuf,

    /// Hyperparameter file (JSON, or TOML by extension). Defaults to ~/.segtrain.json
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Run directory to resume from (needs model.ckpt and evolution.json)
    #[arg(long)]
    pub path_model_init: Option<PathBuf>,

    /// Device to place the network on (cpu, gpu:0, gpu:1)
    #[arg(long, default_value = "cpu")]
    pub gpu: Device,

    /// Train while the epoch counter is below this value
    #[arg(long, default_value_t = 2500)]
    pub max_epoch: u32,

    /// Steps between saves of the latest checkpoint, history and report
    #[arg(long, default_value_t = 600)]
    pub save_step: u64,

    /// Steps between minibatch debug logs
    #[arg(long, default_value_t = 100)]
    pub display_step: u64,

    /// Also save optimizer state, and require it when resuming
    #[arg(long)]
    pub save_all_variables: bool,

    /// Seed for weight initialization and batch sampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the run manifest as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: TrainArgs) -> Result<()> {
    let config = load_training_config(args.config.as_deref(), default_config_path().as_deref())?;

    let options = RunOptions {
        max_epoch: args.max_epoch,
        save_step: args.save_step,
        display_step: args.display_step,
        save_trainable: !args.save_all_variables,
        device: args.gpu,
    };
    let mut request = TrainingRequest::new(&args.path_training, &args.path_model, config).with_options(options);
    if let Some(init) = &args.path_model_init {
        request = request.resume_from(init);
    }

    let datasets = DirectoryDatasetLoader::new(args.seed);
    let builder = PixelConvNetBuilder::new(args.seed);
    let outcome = train_model(request, &datasets, &builder)
        .with_context(|| format!("Training run {} failed", args.path_model.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.manifest)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run: {}", args.path_model.display().to_string().cyan());
    println!("  Steps: {}", outcome.steps);
    println!("  Last epoch: {}", outcome.last_epoch);
    match outcome.best {
        Some(best) => println!(
            "  Best: epoch {} (accuracy {:.4}, loss {:.4}), {} promotion(s) this run",
            best.epoch, best.best_accuracy, best.best_loss, outcome.promotions
        ),
        None => println!("  Best: {}", "no validation pass yet".dimmed()),
    }
    println!();
    Ok(())
}
