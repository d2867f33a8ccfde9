use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    /// Missing or inconsistent hyperparameters. Raised before the loop starts.
    #[error("invalid training config: {0}")]
    Config(String),

    /// The requested resume directory lacks a checkpoint or history file.
    #[error("cannot resume training: {0}")]
    Resume(String),

    #[error("failed to restore checkpoint {}: {reason}", path.display())]
    Restore { path: PathBuf, reason: String },

    #[error("invalid metric history {}: {reason}", path.display())]
    History { path: PathBuf, reason: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("model error: {0}")]
    Model(String),

    /// The optimizer produced a non-finite loss. The run stops without writing anything further.
    #[error("training diverged at step {step}: loss = {loss}")]
    Divergence { step: u64, loss: f32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrainingError {
    pub(crate) fn restore(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Restore { path: path.into(), reason: reason.into() }
    }

    pub(crate) fn history(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::History { path: path.into(), reason: reason.into() }
    }
}
