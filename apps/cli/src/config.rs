//! Resolution of the training config file.

use anyhow::{Context, Result};
use segtrain_training::TrainingConfig;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_CONFIG_FILE: &str = ".segtrain.json";

/// `~/.segtrain.json`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE))
}

/// Loads the training config.
///
/// An explicit path must exist and parse. Without one, the default path is used
/// when it exists; otherwise the built-in defaults apply.
pub fn load_training_config(explicit: Option<&Path>, default_path: Option<&Path>) -> Result<TrainingConfig> {
    if let Some(path) = explicit {
        return TrainingConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()));
    }

    match default_path {
        Some(path) if path.exists() => TrainingConfig::from_file(path)
            .with_context(|| format!("Failed to load default config file {}", path.display())),
        Some(path) => {
            warn!(path = %path.display(), "no config file found, using default hyperparameters");
            Ok(TrainingConfig::default())
        }
        None => {
            warn!("no home directory, using default hyperparameters");
            Ok(TrainingConfig::default())
        }
    }
}
