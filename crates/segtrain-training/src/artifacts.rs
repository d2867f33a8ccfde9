use crate::checkpoint::CheckpointSlot;
use crate::config::{Device, TrainingConfig};
use crate::dataset::Split;
use crate::error::TrainingResult;
use crate::layout::{RunLayout, write_atomic};
use crate::policy::BestModelState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Hyperparameters,
    LatestCheckpoint,
    BestCheckpoint,
    History,
    Report,
    Summaries,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// Hyperparameters of a run as persisted before the first step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterRecord {
    #[serde(flatten)]
    pub config: TrainingConfig,
    pub restored_from: Option<PathBuf>,
    pub device: Device,
    pub save_trainable: bool,
    pub created_at: DateTime<Utc>,
}

impl HyperparameterRecord {
    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

/// Index of every artifact a run left behind, written when the run terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub steps: u64,
    pub last_epoch: u32,
    pub best: Option<BestModelState>,
    pub artifacts: Vec<RunArtifact>,
}

impl RunManifest {
    /// Hashes every artifact of `layout` present on disk.
    pub fn collect(layout: &RunLayout, steps: u64, last_epoch: u32, best: Option<BestModelState>) -> TrainingResult<Self> {
        let candidates = [
            (ArtifactKind::Hyperparameters, layout.hyperparameters_path()),
            (ArtifactKind::LatestCheckpoint, layout.checkpoint_path(CheckpointSlot::Latest)),
            (ArtifactKind::BestCheckpoint, layout.checkpoint_path(CheckpointSlot::Best)),
            (ArtifactKind::History, layout.history_path()),
            (ArtifactKind::Report, layout.report_path()),
            (ArtifactKind::Summaries, layout.summaries_path(Split::Train.as_str())),
            (ArtifactKind::Summaries, layout.summaries_path(Split::Validation.as_str())),
        ];

        let mut artifacts = Vec::new();
        for (kind, path) in candidates {
            if path.exists() {
                artifacts.push(make_artifact(kind, path)?);
            }
        }

        Ok(Self {
            run_dir: layout.root().to_path_buf(),
            created_at: Utc::now(),
            steps,
            last_epoch,
            best,
            artifacts,
        })
    }

    pub fn write(&self, path: &Path) -> TrainingResult<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    #[must_use]
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&RunArtifact> {
        self.artifacts.iter().find(|a| a.kind == kind)
    }
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<RunArtifact> {
    let sha256 = sha256_file(&path)?;
    Ok(RunArtifact { kind, path, sha256 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_only_lists_existing_files() {
        let temp = TempDir::new().unwrap();
        let layout = RunLayout::new(temp.path());
        std::fs::write(layout.history_path(), b"{\"records\": []}").unwrap();
        std::fs::write(layout.report_path(), b"report").unwrap();

        let manifest = RunManifest::collect(&layout, 10, 2, None).unwrap();
        assert_eq!(manifest.artifacts.len(), 2);
        assert!(manifest.artifact(ArtifactKind::BestCheckpoint).is_none());
        assert_eq!(
            manifest.artifact(ArtifactKind::Report).unwrap().sha256,
            sha256_file(&layout.report_path()).unwrap()
        );
    }

    #[test]
    fn test_hyperparameters_use_network_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hyperparameters.json");
        let record = HyperparameterRecord {
            config: TrainingConfig::default(),
            restored_from: None,
            device: Device::Gpu(1),
            save_trainable: true,
            created_at: Utc::now(),
        };
        record.write(&path).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["network_batch_size"], 8);
        assert_eq!(json["device"], "gpu:1");
        assert_eq!(HyperparameterRecord::load(&path).unwrap(), record);
    }
}
