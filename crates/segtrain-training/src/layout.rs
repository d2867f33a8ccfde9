use crate::checkpoint::CheckpointSlot;
use crate::error::TrainingResult;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Filesystem layout of a training run directory.
///
/// ```text
/// <run>/hyperparameters.json
/// <run>/model.ckpt
/// <run>/best_model.ckpt
/// <run>/evolution.json
/// <run>/report.txt
/// <run>/manifest.json
/// <run>/train/summaries.jsonl
/// <run>/validation/summaries.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn hyperparameters_path(&self) -> PathBuf {
        self.root.join("hyperparameters.json")
    }

    #[must_use]
    pub fn checkpoint_path(&self, slot: CheckpointSlot) -> PathBuf {
        self.root.join(slot.file_name())
    }

    #[must_use]
    pub fn history_path(&self) -> PathBuf {
        self.root.join("evolution.json")
    }

    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.txt")
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    #[must_use]
    pub fn summaries_path(&self, split: &str) -> PathBuf {
        self.root.join(split).join("summaries.jsonl")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Writes `content` next to `path` under a unique temporary name, then renames it
/// over `path`. A crash mid-write leaves the previous file intact.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> TrainingResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let stem = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
    let temp_path = parent.join(format!(".{stem}.tmp.{}", Uuid::new_v4()));

    if let Err(e) = fs::write(&temp_path, content) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new("/runs/axon");
        assert_eq!(layout.checkpoint_path(CheckpointSlot::Latest), PathBuf::from("/runs/axon/model.ckpt"));
        assert_eq!(layout.checkpoint_path(CheckpointSlot::Best), PathBuf::from("/runs/axon/best_model.ckpt"));
        assert_eq!(layout.history_path(), PathBuf::from("/runs/axon/evolution.json"));
        assert_eq!(
            layout.summaries_path("validation"),
            PathBuf::from("/runs/axon/validation/summaries.jsonl")
        );
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("evolution.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
