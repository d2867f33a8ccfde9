//! PNG training sets laid out as `<root>/<split>/image_<i>.png` + `mask_<i>.png`.

use ndarray::{Array2, Array3, Array4, Axis};
use segtrain_training::{
    AugmentationPolicy, Batch, DatasetLoader, InMemoryDataset, Sample, SegmentationDataset, Split, TrainingError,
    TrainingResult,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_PREFIX: &str = "image_";
const MASK_PREFIX: &str = "mask_";

/// Grayscale images normalized to [0, 1] with one-hot masks.
///
/// Weight maps are class-balanced over each batch: a pixel of class `c` weighs
/// `n_pixels / (n_classes * count(c))`.
pub struct DirectoryDataset {
    inner: InMemoryDataset,
    n_classes: usize,
}

impl DirectoryDataset {
    pub fn open(dir: &Path, thresholds: &[f32], seed: u64) -> TrainingResult<Self> {
        if thresholds.is_empty() {
            return Err(TrainingError::Dataset("at least one class threshold is required".to_string()));
        }
        let indices = sample_indices(dir)?;

        let mut samples = Vec::with_capacity(indices.len());
        for index in indices {
            let image_path = dir.join(format!("{IMAGE_PREFIX}{index}.png"));
            let mask_path = dir.join(format!("{MASK_PREFIX}{index}.png"));
            if !mask_path.is_file() {
                return Err(TrainingError::Dataset(format!("{} has no mask", image_path.display())));
            }
            let image = read_gray(&image_path)?;
            let mask = read_gray(&mask_path)?;
            if mask.dim() != image.dim() {
                return Err(TrainingError::Dataset(format!(
                    "{} is {:?}, its image {:?}",
                    mask_path.display(),
                    mask.dim(),
                    image.dim()
                )));
            }
            samples.push(Sample { image, labels: one_hot(&mask, thresholds), weights: None });
        }

        debug!(dir = %dir.display(), samples = samples.len(), "dataset loaded");
        Ok(Self { inner: InMemoryDataset::new(samples, seed)?, n_classes: thresholds.len() })
    }
}

impl SegmentationDataset for DirectoryDataset {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn next_batch(&mut self, n: usize, randomize: bool, augmentation: &AugmentationPolicy) -> TrainingResult<Batch> {
        self.inner.next_batch(n, randomize, augmentation)
    }

    fn next_batch_with_weights(
        &mut self,
        n: usize,
        randomize: bool,
        augmentation: &AugmentationPolicy,
    ) -> TrainingResult<Batch> {
        let mut batch = self.inner.next_batch(n, randomize, augmentation)?;
        batch.weights = Some(class_balanced_weights(&batch.labels, self.n_classes));
        Ok(batch)
    }

    fn reset_cursor(&mut self) {
        self.inner.reset_cursor();
    }
}

/// Opens `<root>/train` and `<root>/validation`. Sampling is seeded from entropy
/// unless a seed is given.
#[derive(Debug, Clone, Default)]
pub struct DirectoryDatasetLoader {
    seed: Option<u64>,
}

impl DirectoryDatasetLoader {
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }
}

impl DatasetLoader for DirectoryDatasetLoader {
    fn open(&self, root: &Path, split: Split, thresholds: &[f32]) -> TrainingResult<Box<dyn SegmentationDataset>> {
        let dir: PathBuf = root.join(split.as_str());
        if !dir.is_dir() {
            return Err(TrainingError::Dataset(format!("{} is not a directory", dir.display())));
        }
        let base = self.seed.unwrap_or_else(rand::random);
        let seed = match split {
            Split::Train => base,
            Split::Validation => base.wrapping_add(1),
        };
        Ok(Box::new(DirectoryDataset::open(&dir, thresholds, seed)?))
    }
}

/// Sorted indices `i` of every `image_<i>.png` in `dir`.
fn sample_indices(dir: &Path) -> TrainingResult<Vec<u64>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(index) = name
            .strip_prefix(IMAGE_PREFIX)
            .and_then(|rest| rest.strip_suffix(".png"))
            .and_then(|i| i.parse::<u64>().ok())
        {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

fn read_gray(path: &Path) -> TrainingResult<Array2<f32>> {
    let gray = image::open(path)
        .map_err(|e| TrainingError::Dataset(format!("cannot read {}: {e}", path.display())))?
        .to_luma8();
    let (width, height) = gray.dimensions();
    let pixels = gray.into_raw().into_iter().map(|p| f32::from(p) / 255.0).collect();
    Array2::from_shape_vec((height as usize, width as usize), pixels)
        .map_err(|e| TrainingError::Dataset(format!("{}: {e}", path.display())))
}

/// Each pixel belongs to the highest class whose threshold its mask value reaches.
fn one_hot(mask: &Array2<f32>, thresholds: &[f32]) -> Array3<f32> {
    let (h, w) = mask.dim();
    let mut labels = Array3::zeros((h, w, thresholds.len()));
    for ((y, x), &value) in mask.indexed_iter() {
        let class = thresholds.iter().rposition(|&t| value >= t).unwrap_or(0);
        labels[[y, x, class]] = 1.0;
    }
    labels
}

fn class_balanced_weights(labels: &Array4<f32>, n_classes: usize) -> Array3<f32> {
    let mut counts = vec![0usize; n_classes];
    for lane in labels.lanes(Axis(3)) {
        if let Some(class) = lane.iter().position(|&v| v > 0.5) {
            counts[class] += 1;
        }
    }
    let pixels: usize = counts.iter().sum();
    let (n, h, w, _) = labels.dim();
    let mut weights = Array3::ones((n, h, w));
    for ((b, y, x), weight) in weights.indexed_iter_mut() {
        let lane = labels.slice(ndarray::s![b, y, x, ..]);
        if let Some(class) = lane.iter().position(|&v| v > 0.5) {
            *weight = pixels as f32 / (n_classes * counts[class]) as f32;
        }
    }
    weights
}
