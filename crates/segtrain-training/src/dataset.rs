//! The dataset collaborator seam: batches of images, one-hot labels and optional
//! per-pixel weight maps.

use crate::config::AugmentationPolicy;
use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, stack};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch of `n` images of `h × w` pixels.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(n, h, w)`, intensities in [0, 1].
    pub images: Array3<f32>,
    /// `(n, h, w, n_classes)`, one-hot.
    pub labels: Array4<f32>,
    /// `(n, h, w)`, only present for weighted draws.
    pub weights: Option<Array3<f32>>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks that images, labels and weights agree on `(n, h, w)`.
    pub fn check_shapes(&self) -> TrainingResult<()> {
        let (n, h, w) = self.images.dim();
        let (ln, lh, lw, _) = self.labels.dim();
        if (ln, lh, lw) != (n, h, w) {
            return Err(TrainingError::Dataset(format!(
                "labels have shape {:?}, images {:?}",
                self.labels.shape(),
                self.images.shape()
            )));
        }
        if let Some(weights) = &self.weights {
            if weights.dim() != (n, h, w) {
                return Err(TrainingError::Dataset(format!(
                    "weights have shape {:?}, images {:?}",
                    weights.shape(),
                    self.images.shape()
                )));
            }
        }
        Ok(())
    }
}

/// Source of training or validation batches.
pub trait SegmentationDataset {
    fn size(&self) -> usize;

    /// Draws `n` samples; randomized draws sample uniformly, sequential draws read
    /// from the cursor onward.
    fn next_batch(&mut self, n: usize, randomize: bool, augmentation: &AugmentationPolicy) -> TrainingResult<Batch>;

    /// Same as `next_batch` with `Batch::weights` filled in.
    fn next_batch_with_weights(
        &mut self,
        n: usize,
        randomize: bool,
        augmentation: &AugmentationPolicy,
    ) -> TrainingResult<Batch>;

    /// Rewinds sequential reads to the first sample.
    fn reset_cursor(&mut self);
}

/// Opens the dataset of one split of a training set.
pub trait DatasetLoader {
    fn open(&self, root: &Path, split: Split, thresholds: &[f32]) -> TrainingResult<Box<dyn SegmentationDataset>>;
}

/// One labeled image.
#[derive(Debug, Clone)]
pub struct Sample {
    /// `(h, w)`
    pub image: Array2<f32>,
    /// `(h, w, n_classes)`, one-hot.
    pub labels: Array3<f32>,
    /// `(h, w)`; all ones when absent.
    pub weights: Option<Array2<f32>>,
}

/// A dataset held in memory. Augmentation tokens are ignored.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
    cursor: usize,
    rng: StdRng,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>, seed: u64) -> TrainingResult<Self> {
        if let Some(first) = samples.first() {
            let dims = first.image.dim();
            let classes = first.labels.len_of(Axis(2));
            for (index, sample) in samples.iter().enumerate() {
                let (lh, lw, lc) = sample.labels.dim();
                if sample.image.dim() != dims || (lh, lw) != dims || lc != classes {
                    return Err(TrainingError::Dataset(format!(
                        "sample {index} does not match the shape of sample 0"
                    )));
                }
                if sample.weights.as_ref().is_some_and(|w| w.dim() != dims) {
                    return Err(TrainingError::Dataset(format!("sample {index} has a mis-shaped weight map")));
                }
            }
        }
        Ok(Self { samples, cursor: 0, rng: StdRng::seed_from_u64(seed) })
    }

    fn indices(&mut self, n: usize, randomize: bool) -> TrainingResult<Vec<usize>> {
        if self.samples.is_empty() {
            return Err(TrainingError::Dataset("cannot draw from an empty dataset".to_string()));
        }
        let len = self.samples.len();
        if randomize {
            return Ok((0..n).map(|_| self.rng.gen_range(0..len)).collect());
        }
        let indices = (0..n).map(|i| (self.cursor + i) % len).collect();
        self.cursor = (self.cursor + n) % len;
        Ok(indices)
    }

    fn assemble(&self, indices: &[usize], with_weights: bool) -> TrainingResult<Batch> {
        let images: Vec<ArrayView2<'_, f32>> = indices.iter().map(|&i| self.samples[i].image.view()).collect();
        let labels: Vec<ArrayView3<'_, f32>> = indices.iter().map(|&i| self.samples[i].labels.view()).collect();
        let images = stack(Axis(0), &images).map_err(|e| TrainingError::Dataset(e.to_string()))?;
        let labels = stack(Axis(0), &labels).map_err(|e| TrainingError::Dataset(e.to_string()))?;

        let weights = if with_weights {
            let (_, h, w) = images.dim();
            let ones = Array2::ones((h, w));
            let maps: Vec<ArrayView2<'_, f32>> = indices
                .iter()
                .map(|&i| self.samples[i].weights.as_ref().map_or_else(|| ones.view(), Array2::view))
                .collect();
            Some(stack(Axis(0), &maps).map_err(|e| TrainingError::Dataset(e.to_string()))?)
        } else {
            None
        };

        Ok(Batch { images, labels, weights })
    }
}

impl SegmentationDataset for InMemoryDataset {
    fn size(&self) -> usize {
        self.samples.len()
    }

    fn next_batch(&mut self, n: usize, randomize: bool, _augmentation: &AugmentationPolicy) -> TrainingResult<Batch> {
        let indices = self.indices(n, randomize)?;
        self.assemble(&indices, false)
    }

    fn next_batch_with_weights(
        &mut self,
        n: usize,
        randomize: bool,
        _augmentation: &AugmentationPolicy,
    ) -> TrainingResult<Batch> {
        let indices = self.indices(n, randomize)?;
        self.assemble(&indices, true)
    }

    fn reset_cursor(&mut self) {
        self.cursor = 0;
    }
}
