//! Append-only record of validation metrics, one entry per completed epoch.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub epoch: u32,
    pub loss: f32,
    pub accuracy: f32,
}

impl MetricRecord {
    #[must_use]
    pub fn new(epoch: u32, loss: f32, accuracy: f32) -> Self {
        Self { epoch, loss, accuracy }
    }

    fn check(&self) -> Result<(), String> {
        if !self.loss.is_finite() || self.loss < 0.0 {
            return Err(format!("epoch {} has invalid loss {}", self.epoch, self.loss));
        }
        if !(0.0..=1.0).contains(&self.accuracy) {
            return Err(format!("epoch {} has accuracy {} outside [0, 1]", self.epoch, self.accuracy));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricHistory {
    records: Vec<MetricRecord>,
}

#[derive(Serialize)]
struct HistoryFileRef<'a> {
    records: &'a [MetricRecord],
}

/// Accepted on-disk shapes: the record list, or parallel columns as written by older runs.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryFile {
    Records { records: Vec<MetricRecord> },
    Columns { loss: Vec<f32>, steps: Vec<u32>, accuracy: Vec<f32> },
}

impl MetricHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `record`. Its epoch must be greater than the last recorded one.
    pub fn append(&mut self, record: MetricRecord) -> TrainingResult<()> {
        if let Some(last) = self.records.last()
            && record.epoch <= last.epoch
        {
            return Err(TrainingError::History {
                path: PathBuf::new(),
                reason: format!("epoch {} appended after epoch {}", record.epoch, last.epoch),
            });
        }
        self.records.push(record);
        Ok(())
    }

    #[must_use]
    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    #[must_use]
    pub fn last(&self) -> Option<&MetricRecord> {
        self.records.last()
    }

    /// Epoch of the final record, or 0 when empty.
    #[must_use]
    pub fn last_epoch(&self) -> u32 {
        self.records.last().map_or(0, |r| r.epoch)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn persist(&self, path: &Path) -> TrainingResult<()> {
        let json = serde_json::to_vec_pretty(&HistoryFileRef { records: &self.records })?;
        write_atomic(path, &json)
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| TrainingError::history(path, format!("cannot read history: {e}")))?;
        let file: HistoryFile = serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::history(path, format!("malformed history: {e}")))?;

        let records = match file {
            HistoryFile::Records { records } => records,
            HistoryFile::Columns { loss, steps, accuracy } => {
                if loss.len() != steps.len() || accuracy.len() != steps.len() {
                    return Err(TrainingError::history(
                        path,
                        format!(
                            "column lengths differ: {} epochs, {} losses, {} accuracies",
                            steps.len(),
                            loss.len(),
                            accuracy.len()
                        ),
                    ));
                }
                steps
                    .into_iter()
                    .zip(loss)
                    .zip(accuracy)
                    .map(|((epoch, loss), accuracy)| MetricRecord { epoch, loss, accuracy })
                    .collect()
            }
        };

        let mut history = Self::new();
        for record in records {
            record.check().map_err(|reason| TrainingError::history(path, reason))?;
            history.append(record).map_err(|e| match e {
                TrainingError::History { reason, .. } => TrainingError::history(path, reason),
                other => other,
            })?;
        }
        Ok(history)
    }
}
