//! A single-convolution per-pixel classifier.
//!
//! Input intensities are standardized (batch statistics while training, running
//! statistics at inference), dropped out while training, then mapped to
//! `n_classes` logits by one zero-padded `k × k` convolution.

use ndarray::{Array1, Array3, Array4, ArrayView1, ArrayView3, ArrayView4, Ix1, Ix3, arr1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segtrain_training::{
    Device, Gradients, ModelBuilder, ParameterKind, ParameterSet, Phase, SegmentationNetwork, TrainingConfig,
    TrainingError, TrainingResult,
};
use tracing::debug;

pub const CONV_WEIGHTS: &str = "conv/weights";
pub const CONV_BIAS: &str = "conv/bias";
pub const MOVING_MEAN: &str = "batch_norm/moving_mean";
pub const MOVING_VARIANCE: &str = "batch_norm/moving_variance";

const BN_EPSILON: f32 = 1e-3;

pub struct PixelConvNet {
    params: ParameterSet,
    batch_norm: bool,
    decay: f32,
    rng: StdRng,
    /// Convolution input of the last training forward.
    input: Option<Array3<f32>>,
    /// Batch mean and variance awaiting `commit_statistics`.
    pending: Option<(f32, f32)>,
}

impl PixelConvNet {
    fn vector(&self, name: &str) -> TrainingResult<ArrayView1<'_, f32>> {
        self.params
            .value(name)
            .ok_or_else(|| TrainingError::Model(format!("parameter '{name}' is missing")))?
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|e| TrainingError::Model(format!("{name}: {e}")))
    }

    fn kernel(&self) -> TrainingResult<ArrayView3<'_, f32>> {
        self.params
            .value(CONV_WEIGHTS)
            .ok_or_else(|| TrainingError::Model(format!("parameter '{CONV_WEIGHTS}' is missing")))?
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| TrainingError::Model(format!("{CONV_WEIGHTS}: {e}")))
    }

    fn scalar(&self, name: &str) -> TrainingResult<f32> {
        self.vector(name)?
            .first()
            .copied()
            .ok_or_else(|| TrainingError::Model(format!("parameter '{name}' is empty")))
    }
}

impl SegmentationNetwork for PixelConvNet {
    fn forward(&mut self, images: ArrayView3<'_, f32>, phase: Phase) -> TrainingResult<Array4<f32>> {
        let mut input = images.to_owned();

        if self.batch_norm {
            let (mean, variance) = match phase {
                Phase::Training { .. } => {
                    let mean = input.mean().unwrap_or(0.0);
                    let variance = input.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
                    self.pending = Some((mean, variance));
                    (mean, variance)
                }
                Phase::Inference => (self.scalar(MOVING_MEAN)?, self.scalar(MOVING_VARIANCE)?),
            };
            let scale = 1.0 / (variance + BN_EPSILON).sqrt();
            input.mapv_inplace(|v| (v - mean) * scale);
        }

        if let Phase::Training { keep_prob } = phase {
            if keep_prob < 1.0 {
                let rng = &mut self.rng;
                input.mapv_inplace(|v| if rng.gen_bool(f64::from(keep_prob)) { v / keep_prob } else { 0.0 });
            }
        }

        let logits = convolve(input.view(), self.kernel()?, self.vector(CONV_BIAS)?);
        if phase.is_training() {
            self.input = Some(input);
        }
        Ok(logits)
    }

    fn backward(&mut self, grad_logits: ArrayView4<'_, f32>) -> TrainingResult<Gradients> {
        let input = self
            .input
            .take()
            .ok_or_else(|| TrainingError::Model("backward called without a training forward".to_string()))?;
        let (n, h, w) = input.dim();
        let (k, _, classes) = self.kernel()?.dim();
        if grad_logits.dim() != (n, h, w, classes) {
            return Err(TrainingError::Model(format!(
                "gradient has shape {:?}, logits are {:?}",
                grad_logits.shape(),
                [n, h, w, classes]
            )));
        }

        let radius = (k / 2) as isize;
        let mut grad_w = Array3::<f32>::zeros((k, k, classes));
        let mut grad_b = Array1::<f32>::zeros(classes);
        for ((b, y, x, c), &g) in grad_logits.indexed_iter() {
            if g == 0.0 {
                continue;
            }
            grad_b[c] += g;
            for dy in 0..k {
                for dx in 0..k {
                    if let Some(v) = padded(input.view(), b, y, x, dy, dx, radius) {
                        grad_w[[dy, dx, c]] += g * v;
                    }
                }
            }
        }

        let mut grads = Gradients::new();
        grads.insert(CONV_WEIGHTS.to_string(), grad_w.into_dyn());
        grads.insert(CONV_BIAS.to_string(), grad_b.into_dyn());
        Ok(grads)
    }

    fn commit_statistics(&mut self) {
        let Some((mean, variance)) = self.pending.take() else { return };
        let decay = self.decay;
        for (name, batch) in [(MOVING_MEAN, mean), (MOVING_VARIANCE, variance)] {
            if let Some(moving) = self.params.value_mut(name) {
                moving.mapv_inplace(|m| decay * m + (1.0 - decay) * batch);
            }
        }
    }

    fn parameters(&self) -> &ParameterSet {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }
}

/// Input value under kernel tap `(dy, dx)` centered on `(y, x)`; `None` in the padding.
fn padded(input: ArrayView3<'_, f32>, b: usize, y: usize, x: usize, dy: usize, dx: usize, radius: isize) -> Option<f32> {
    let (_, h, w) = input.dim();
    let sy = y as isize + dy as isize - radius;
    let sx = x as isize + dx as isize - radius;
    if sy < 0 || sx < 0 || sy >= h as isize || sx >= w as isize {
        return None;
    }
    Some(input[[b, sy as usize, sx as usize]])
}

fn convolve(input: ArrayView3<'_, f32>, kernel: ArrayView3<'_, f32>, bias: ArrayView1<'_, f32>) -> Array4<f32> {
    let (n, h, w) = input.dim();
    let (k, _, classes) = kernel.dim();
    let radius = (k / 2) as isize;

    let mut logits = Array4::<f32>::zeros((n, h, w, classes));
    for b in 0..n {
        for y in 0..h {
            for x in 0..w {
                for c in 0..classes {
                    let mut acc = bias[c];
                    for dy in 0..k {
                        for dx in 0..k {
                            if let Some(v) = padded(input, b, y, x, dy, dx, radius) {
                                acc += kernel[[dy, dx, c]] * v;
                            }
                        }
                    }
                    logits[[b, y, x, c]] = acc;
                }
            }
        }
    }
    logits
}

/// Builds a `PixelConvNet` with Glorot-uniform kernel weights and zero bias.
#[derive(Debug, Clone, Default)]
pub struct PixelConvNetBuilder {
    seed: Option<u64>,
}

impl PixelConvNetBuilder {
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    fn build_net(&self, config: &TrainingConfig) -> TrainingResult<PixelConvNet> {
        let k = config
            .size_of_convolutions_per_layer
            .first()
            .and_then(|layer| layer.first())
            .copied()
            .ok_or_else(|| TrainingError::Config("size_of_convolutions_per_layer is empty".to_string()))?;
        if k % 2 == 0 {
            return Err(TrainingError::Config(format!("kernel size {k} must be odd")));
        }
        let classes = config.n_classes;

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let limit = (6.0 / (k * k + classes) as f32).sqrt();
        let kernel = Array3::from_shape_simple_fn((k, k, classes), || rng.gen_range(-limit..limit));

        let mut params = ParameterSet::new();
        params.insert(CONV_WEIGHTS, ParameterKind::Trainable, kernel.into_dyn());
        params.insert(CONV_BIAS, ParameterKind::Trainable, Array1::<f32>::zeros(classes).into_dyn());
        if config.batch_norm {
            params.insert(MOVING_MEAN, ParameterKind::Statistic, arr1(&[0.0f32]).into_dyn());
            params.insert(MOVING_VARIANCE, ParameterKind::Statistic, arr1(&[1.0f32]).into_dyn());
        }

        Ok(PixelConvNet {
            params,
            batch_norm: config.batch_norm,
            decay: config.batch_norm_decay,
            rng,
            input: None,
            pending: None,
        })
    }
}

impl ModelBuilder for PixelConvNetBuilder {
    fn build(&self, config: &TrainingConfig, device: Device) -> TrainingResult<Box<dyn SegmentationNetwork>> {
        let net = self.build_net(config)?;
        debug!(
            device = %device,
            trainable = net.params.scalar_count(ParameterKind::Trainable),
            batch_norm = net.batch_norm,
            "pixel conv net built"
        );
        Ok(Box::new(net))
    }
}
