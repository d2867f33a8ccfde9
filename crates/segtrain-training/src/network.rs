//! The network collaborator seam.

use crate::config::{Device, TrainingConfig};
use crate::error::TrainingResult;
use crate::params::{Gradients, ParameterSet};
use ndarray::{Array4, ArrayView3, ArrayView4};

/// Mode of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    /// Dropout active with the given keep probability; normalization uses batch statistics.
    Training { keep_prob: f32 },
    /// Dropout disabled; normalization uses the running statistics.
    Inference,
}

impl Phase {
    #[must_use]
    pub fn is_training(self) -> bool {
        matches!(self, Self::Training { .. })
    }
}

/// A per-pixel classifier over single-channel images.
///
/// `forward` maps images `(n, h, w)` to logits `(n, h, w, n_classes)`. A training-phase
/// `forward` must be followed by `backward` before the next `forward`; `backward`
/// returns the gradient of every trainable parameter for that pass. Running statistics
/// computed by the pass only take effect on `commit_statistics`.
pub trait SegmentationNetwork {
    fn forward(&mut self, images: ArrayView3<'_, f32>, phase: Phase) -> TrainingResult<Array4<f32>>;

    fn backward(&mut self, grad_logits: ArrayView4<'_, f32>) -> TrainingResult<Gradients>;

    fn commit_statistics(&mut self);

    fn parameters(&self) -> &ParameterSet;

    fn parameters_mut(&mut self) -> &mut ParameterSet;
}

/// Instantiates a network from hyperparameters.
pub trait ModelBuilder {
    fn build(&self, config: &TrainingConfig, device: Device) -> TrainingResult<Box<dyn SegmentationNetwork>>;
}
