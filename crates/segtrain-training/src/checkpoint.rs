//! Durable parameter snapshots in named slots.
//!
//! A checkpoint file is JSON: a header (slot, epoch, scope, timestamp, digest) and one
//! record per tensor holding its shape and its little-endian `f32` bytes in base64.
//! Storing raw bytes keeps `save` followed by `restore` bit-identical.

use crate::error::{TrainingError, TrainingResult};
use crate::layout::write_atomic;
use crate::params::{ParameterKind, ParameterSet};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSlot {
    Latest,
    Best,
}

impl CheckpointSlot {
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Latest => "model.ckpt",
            Self::Best => "best_model.ckpt",
        }
    }
}

impl fmt::Display for CheckpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Best => write!(f, "best"),
        }
    }
}

/// Which parameters a checkpoint carries. Declared once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointScope {
    /// Trainable parameters and normalization statistics.
    Model,
    /// Model parameters plus optimizer state.
    All,
}

impl CheckpointScope {
    #[must_use]
    pub fn from_save_trainable(save_trainable: bool) -> Self {
        if save_trainable { Self::Model } else { Self::All }
    }

    #[must_use]
    pub fn includes(self, kind: ParameterKind) -> bool {
        match self {
            Self::Model => kind.is_model(),
            Self::All => true,
        }
    }
}

/// A restored snapshot.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub slot: CheckpointSlot,
    /// Last completed epoch when the snapshot was taken.
    pub epoch: u32,
    pub scope: CheckpointScope,
    pub created_at: DateTime<Utc>,
    pub parameters: ParameterSet,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    format_version: u32,
    slot: CheckpointSlot,
    epoch: u32,
    scope: CheckpointScope,
    created_at: DateTime<Utc>,
    digest: String,
    parameters: BTreeMap<String, TensorRecord>,
}

#[derive(Serialize, Deserialize)]
struct TensorRecord {
    kind: ParameterKind,
    shape: Vec<usize>,
    data: String,
}

/// Owns the checkpoint files of one run directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    scope: CheckpointScope,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, scope: CheckpointScope) -> Self {
        Self { dir: dir.into(), scope }
    }

    #[must_use]
    pub fn scope(&self) -> CheckpointScope {
        self.scope
    }

    #[must_use]
    pub fn path(&self, slot: CheckpointSlot) -> PathBuf {
        self.dir.join(slot.file_name())
    }

    /// Serializes the scope's subset of `parameters` into `slot`, atomically replacing
    /// the previous snapshot.
    pub fn save(&self, slot: CheckpointSlot, epoch: u32, parameters: &ParameterSet) -> TrainingResult<PathBuf> {
        let selected = parameters.filter(|kind| self.scope.includes(kind));

        let records = selected
            .iter()
            .map(|(name, p)| {
                let record = TensorRecord {
                    kind: p.kind,
                    shape: p.value.shape().to_vec(),
                    data: STANDARD.encode(tensor_bytes(&p.value)),
                };
                (name.clone(), record)
            })
            .collect();

        let file = CheckpointFile {
            format_version: FORMAT_VERSION,
            slot,
            epoch,
            scope: self.scope,
            created_at: Utc::now(),
            digest: digest(&selected),
            parameters: records,
        };

        let path = self.path(slot);
        write_atomic(&path, &serde_json::to_vec(&file)?)?;
        debug!(slot = %slot, epoch, tensors = selected.len(), path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    pub fn restore_slot(&self, slot: CheckpointSlot) -> TrainingResult<Checkpoint> {
        Self::restore(&self.path(slot))
    }

    /// Reads a checkpoint file and verifies its digest.
    pub fn restore(path: &Path) -> TrainingResult<Checkpoint> {
        let bytes = std::fs::read(path)
            .map_err(|e| TrainingError::restore(path, format!("cannot read checkpoint: {e}")))?;
        let file: CheckpointFile = serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::restore(path, format!("malformed checkpoint: {e}")))?;

        if file.format_version != FORMAT_VERSION {
            return Err(TrainingError::restore(
                path,
                format!("unsupported checkpoint format version {}", file.format_version),
            ));
        }

        let mut parameters = ParameterSet::new();
        for (name, record) in file.parameters {
            let value = decode_tensor(&record).map_err(|reason| {
                TrainingError::restore(path, format!("tensor '{name}': {reason}"))
            })?;
            parameters.insert(name, record.kind, value);
        }

        if digest(&parameters) != file.digest {
            return Err(TrainingError::restore(path, "digest mismatch, the checkpoint is corrupted"));
        }

        Ok(Checkpoint {
            slot: file.slot,
            epoch: file.epoch,
            scope: file.scope,
            created_at: file.created_at,
            parameters,
        })
    }
}

fn tensor_bytes(value: &ArrayD<f32>) -> Vec<u8> {
    value.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_tensor(record: &TensorRecord) -> Result<ArrayD<f32>, String> {
    let bytes = STANDARD.decode(&record.data).map_err(|e| format!("invalid base64: {e}"))?;
    let expected = record.shape.iter().product::<usize>() * 4;
    if bytes.len() != expected {
        return Err(format!("holds {} bytes, shape {:?} needs {expected}", bytes.len(), record.shape));
    }

    let data = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    ArrayD::from_shape_vec(IxDyn(&record.shape), data).map_err(|e| e.to_string())
}

fn digest(parameters: &ParameterSet) -> String {
    let mut hasher = Sha256::new();
    for (name, p) in parameters {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}", p.kind).as_bytes());
        for &dim in p.value.shape() {
            hasher.update((dim as u64).to_le_bytes());
        }
        hasher.update(tensor_bytes(&p.value));
    }
    hex::encode(hasher.finalize())
}
