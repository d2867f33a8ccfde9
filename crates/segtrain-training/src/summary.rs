//! Per-epoch scalar summaries for the train and validation splits.

use crate::dataset::Split;
use crate::error::TrainingResult;
use crate::layout::RunLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub split: Split,
    pub epoch: u32,
    pub step: u64,
    pub loss: f32,
    pub accuracy: f32,
    pub timestamp: DateTime<Utc>,
}

impl SummaryRecord {
    #[must_use]
    pub fn new(split: Split, epoch: u32, step: u64, loss: f32, accuracy: f32) -> Self {
        Self { split, epoch, step, loss, accuracy, timestamp: Utc::now() }
    }
}

pub trait SummarySink {
    fn on_record(&mut self, record: &SummaryRecord) -> TrainingResult<()>;
}

/// Logs each record and appends it as one JSON line to `<run>/<split>/summaries.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlSummaryWriter {
    layout: RunLayout,
}

impl JsonlSummaryWriter {
    #[must_use]
    pub fn new(layout: RunLayout) -> Self {
        Self { layout }
    }
}

impl SummarySink for JsonlSummaryWriter {
    fn on_record(&mut self, record: &SummaryRecord) -> TrainingResult<()> {
        info!(
            split = %record.split,
            epoch = record.epoch,
            step = record.step,
            loss = record.loss,
            accuracy = record.accuracy,
            "epoch summary"
        );

        let path = self.layout.summaries_path(record.split.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }
}

/// Logs records without writing anything.
#[derive(Debug, Default)]
pub struct TracingSummarySink;

impl SummarySink for TracingSummarySink {
    fn on_record(&mut self, record: &SummaryRecord) -> TrainingResult<()> {
        info!(
            split = %record.split,
            epoch = record.epoch,
            step = record.step,
            loss = record.loss,
            accuracy = record.accuracy,
            "epoch summary"
        );
        Ok(())
    }
}

/// Reads back every record of one split. A missing file yields no records.
pub fn read_summaries(layout: &RunLayout, split: Split) -> TrainingResult<Vec<SummaryRecord>> {
    let path = layout.summaries_path(split.as_str());
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path)?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_appends_one_line_per_record() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path());
        let mut writer = JsonlSummaryWriter::new(layout.clone());

        writer.on_record(&SummaryRecord::new(Split::Train, 1, 4, 0.7, 0.5)).unwrap();
        writer.on_record(&SummaryRecord::new(Split::Validation, 1, 4, 0.6, 0.55)).unwrap();
        writer.on_record(&SummaryRecord::new(Split::Train, 2, 8, 0.5, 0.65)).unwrap();

        let train = read_summaries(&layout, Split::Train).unwrap();
        assert_eq!(train.len(), 2);
        assert_eq!(train[1].epoch, 2);
        assert!(temp.path().join("validation").join("summaries.jsonl").exists());
        assert_eq!(read_summaries(&layout, Split::Validation).unwrap().len(), 1);
    }

    #[test]
    fn test_tracing_sink_writes_no_files() {
        let temp = TempDir::new().unwrap();
        let mut sink = TracingSummarySink;
        sink.on_record(&SummaryRecord::new(Split::Validation, 3, 12, 0.4, 0.8)).unwrap();

        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
        assert!(read_summaries(&RunLayout::new(temp.path()), Split::Validation).unwrap().is_empty());
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_summaries(&RunLayout::new(temp.path()), Split::Train).unwrap().is_empty());
    }
}
