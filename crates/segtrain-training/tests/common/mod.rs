//! Shared fixtures: a per-pixel linear network and in-memory splits.

#![allow(dead_code)]

use ndarray::{Array1, Array2, Array3, Array4, ArrayView3, ArrayView4, Axis, Ix1, arr1};
use segtrain_training::{
    AugmentationPolicy, Batch, DatasetLoader, Device, Gradients, InMemoryDataset, ModelBuilder, ParameterKind,
    ParameterSet, Phase, Sample, SegmentationDataset, SegmentationNetwork, Split, TrainingConfig, TrainingError,
    TrainingResult,
};
use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;

pub const WEIGHTS: &str = "linear/weights";
pub const BIAS: &str = "linear/bias";
pub const INPUT_MEAN: &str = "linear/input_mean";

/// Logits `w[k] * x + b[k]` for every pixel intensity `x`.
pub struct LinearPixelNet {
    params: ParameterSet,
    inputs: Option<Array3<f32>>,
    pending_mean: Option<f32>,
    training_forwards: Rc<Cell<usize>>,
    diverge_after: Option<usize>,
}

impl SegmentationNetwork for LinearPixelNet {
    fn forward(&mut self, images: ArrayView3<'_, f32>, phase: Phase) -> TrainingResult<Array4<f32>> {
        let (n, h, w) = images.dim();
        let weights = vector(&self.params, WEIGHTS);
        let bias = vector(&self.params, BIAS);
        let classes = weights.len();

        let mut logits = Array4::zeros((n, h, w, classes));
        for ((b, y, x), &value) in images.indexed_iter() {
            for k in 0..classes {
                logits[[b, y, x, k]] = weights[[k]] * value + bias[[k]];
            }
        }

        if phase.is_training() {
            let count = self.training_forwards.get() + 1;
            self.training_forwards.set(count);
            self.inputs = Some(images.to_owned());
            self.pending_mean = images.mean();
            if self.diverge_after.is_some_and(|limit| count > limit) {
                logits.fill(f32::NAN);
            }
        }
        Ok(logits)
    }

    fn backward(&mut self, grad_logits: ArrayView4<'_, f32>) -> TrainingResult<Gradients> {
        let inputs = self
            .inputs
            .take()
            .ok_or_else(|| TrainingError::Model("backward without a training forward".to_string()))?;
        let classes = grad_logits.len_of(Axis(3));
        let mut grad_w = Array1::<f32>::zeros(classes);
        let mut grad_b = Array1::<f32>::zeros(classes);
        for ((b, y, x, k), &g) in grad_logits.indexed_iter() {
            grad_w[k] += g * inputs[[b, y, x]];
            grad_b[k] += g;
        }

        let mut grads = Gradients::new();
        grads.insert(WEIGHTS.to_string(), grad_w.into_dyn());
        grads.insert(BIAS.to_string(), grad_b.into_dyn());
        Ok(grads)
    }

    fn commit_statistics(&mut self) {
        if let (Some(mean), Some(moving)) = (self.pending_mean.take(), self.params.value_mut(INPUT_MEAN)) {
            moving.mapv_inplace(|m| 0.9 * m + 0.1 * mean);
        }
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }
}

fn vector(params: &ParameterSet, name: &str) -> Array1<f32> {
    params.value(name).cloned().unwrap().into_dimensionality::<Ix1>().unwrap()
}

/// Builds a `LinearPixelNet` biased towards class 0, so it starts at chance on
/// balanced masks and has to learn to separate the classes.
#[derive(Clone, Default)]
pub struct LinearPixelNetBuilder {
    pub training_forwards: Rc<Cell<usize>>,
    pub diverge_after: Option<usize>,
}

impl LinearPixelNetBuilder {
    pub fn diverging_after(steps: usize) -> Self {
        Self { diverge_after: Some(steps), ..Self::default() }
    }
}

impl ModelBuilder for LinearPixelNetBuilder {
    fn build(&self, config: &TrainingConfig, _device: Device) -> TrainingResult<Box<dyn SegmentationNetwork>> {
        let classes = config.n_classes;
        let mut bias = Array1::<f32>::zeros(classes);
        bias[0] = 1.0;

        let mut params = ParameterSet::new();
        params.insert(WEIGHTS, ParameterKind::Trainable, Array1::<f32>::zeros(classes).into_dyn());
        params.insert(BIAS, ParameterKind::Trainable, bias.into_dyn());
        params.insert(INPUT_MEAN, ParameterKind::Statistic, arr1(&[0.0f32]).into_dyn());

        Ok(Box::new(LinearPixelNet {
            params,
            inputs: None,
            pending_mean: None,
            training_forwards: Rc::clone(&self.training_forwards),
            diverge_after: self.diverge_after,
        }))
    }
}

/// Counts training draws on top of an `InMemoryDataset`.
pub struct CountingDataset {
    inner: InMemoryDataset,
    draws: Rc<Cell<usize>>,
}

impl SegmentationDataset for CountingDataset {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn next_batch(&mut self, n: usize, randomize: bool, augmentation: &AugmentationPolicy) -> TrainingResult<Batch> {
        self.draws.set(self.draws.get() + 1);
        self.inner.next_batch(n, randomize, augmentation)
    }

    fn next_batch_with_weights(
        &mut self,
        n: usize,
        randomize: bool,
        augmentation: &AugmentationPolicy,
    ) -> TrainingResult<Batch> {
        self.draws.set(self.draws.get() + 1);
        self.inner.next_batch_with_weights(n, randomize, augmentation)
    }

    fn reset_cursor(&mut self) {
        self.inner.reset_cursor();
    }
}

#[derive(Clone, Default)]
pub struct MemoryLoader {
    pub train: Vec<Sample>,
    pub validation: Vec<Sample>,
    pub train_draws: Rc<Cell<usize>>,
    pub validation_draws: Rc<Cell<usize>>,
}

impl MemoryLoader {
    pub fn new(train: usize, validation: usize) -> Self {
        Self {
            train: (0..train).map(sample).collect(),
            validation: (0..validation).map(sample).collect(),
            ..Self::default()
        }
    }
}

impl DatasetLoader for MemoryLoader {
    fn open(&self, _root: &Path, split: Split, _thresholds: &[f32]) -> TrainingResult<Box<dyn SegmentationDataset>> {
        let (samples, draws) = match split {
            Split::Train => (self.train.clone(), &self.train_draws),
            Split::Validation => (self.validation.clone(), &self.validation_draws),
        };
        Ok(Box::new(CountingDataset { inner: InMemoryDataset::new(samples, 11)?, draws: Rc::clone(draws) }))
    }
}

/// A 2×2 image, half background (0.0, class 0) and half foreground (1.0, class 1).
/// Foreground pixels carry weight 2.
pub fn sample(index: usize) -> Sample {
    let foreground = if index % 2 == 0 { [true, false, true, false] } else { [false, true, false, true] };
    let mut image = Array2::<f32>::zeros((2, 2));
    let mut labels = Array3::<f32>::zeros((2, 2, 2));
    let mut weights = Array2::<f32>::ones((2, 2));
    for (i, &fg) in foreground.iter().enumerate() {
        let (y, x) = (i / 2, i % 2);
        if fg {
            image[[y, x]] = 1.0;
            labels[[y, x, 1]] = 1.0;
            weights[[y, x]] = 2.0;
        } else {
            labels[[y, x, 0]] = 1.0;
        }
    }
    Sample { image, labels, weights: Some(weights) }
}

/// Small config matching the fixtures: two classes, batches of one image.
pub fn test_config() -> TrainingConfig {
    TrainingConfig {
        learning_rate: 0.05,
        batch_size: 1,
        dropout: 1.0,
        depth: 1,
        convolution_per_layer: vec![1],
        size_of_convolutions_per_layer: vec![vec![3]],
        features_per_convolution: vec![vec![4]],
        ..TrainingConfig::default()
    }
}
