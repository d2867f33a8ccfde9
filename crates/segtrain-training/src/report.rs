//! Human-readable run report, rewritten on every save.

use crate::config::TrainingConfig;
use crate::error::TrainingResult;
use crate::history::MetricRecord;
use crate::layout::write_atomic;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunReport {
    pub model_dir: PathBuf,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub depth: usize,
    pub epoch_size: u64,
    pub dropout: f32,
    pub restored_from: Option<PathBuf>,
}

impl RunReport {
    #[must_use]
    pub fn new(model_dir: &Path, config: &TrainingConfig, epoch_size: u64, restored_from: Option<&Path>) -> Self {
        Self {
            model_dir: model_dir.to_path_buf(),
            learning_rate: config.learning_rate,
            batch_size: config.batch_size,
            depth: config.depth,
            epoch_size,
            dropout: config.dropout,
            restored_from: restored_from.map(Path::to_path_buf),
        }
    }

    /// Static header followed by the last validation result, if any.
    #[must_use]
    pub fn render(&self, last_validation: Option<&MetricRecord>) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Training report");
        let _ = writeln!(out, "===============");
        let _ = writeln!(out, "model directory : {}", self.model_dir.display());
        let _ = writeln!(out, "learning rate   : {}", self.learning_rate);
        let _ = writeln!(out, "batch size      : {}", self.batch_size);
        let _ = writeln!(out, "depth           : {}", self.depth);
        let _ = writeln!(out, "epoch size      : {}", self.epoch_size);
        let _ = writeln!(out, "dropout (keep)  : {}", self.dropout);
        match &self.restored_from {
            Some(path) => {
                let _ = writeln!(out, "restored from   : {}", path.display());
            }
            None => {
                let _ = writeln!(out, "restored from   : none");
            }
        }
        let _ = writeln!(out);
        match last_validation {
            Some(record) => {
                let _ = writeln!(
                    out,
                    "epoch {}: validation loss = {:.6}, validation accuracy = {:.6}",
                    record.epoch, record.loss, record.accuracy
                );
            }
            None => {
                let _ = writeln!(out, "no validation pass yet");
            }
        }
        out
    }

    pub fn write(&self, path: &Path, last_validation: Option<&MetricRecord>) -> TrainingResult<()> {
        write_atomic(path, self.render(last_validation).as_bytes())
    }
}
