//! Pixel-wise softmax cross-entropy, optionally weighted per pixel, and pixel accuracy.

use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array4, ArrayView1, ArrayView3, ArrayView4, s};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    /// Mean cross-entropy over all pixels of the batch.
    Unweighted,
    /// Mean of per-pixel cross-entropy multiplied by the pixel's weight.
    Weighted,
}

impl Cost {
    #[must_use]
    pub fn for_config(weighted_cost: bool) -> Self {
        if weighted_cost { Self::Weighted } else { Self::Unweighted }
    }

    #[must_use]
    pub fn needs_weights(self) -> bool {
        self == Self::Weighted
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unweighted => write!(f, "cross_entropy"),
            Self::Weighted => write!(f, "weighted_cross_entropy"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CostEvaluation {
    pub loss: f32,
    pub accuracy: f32,
    /// Gradient of `loss` with respect to the logits, when requested.
    pub grad_logits: Option<Array4<f32>>,
}

impl Cost {
    /// Loss and accuracy of `logits` against one-hot `labels`, both `(n, h, w, c)`.
    pub fn evaluate(
        self,
        logits: ArrayView4<'_, f32>,
        labels: ArrayView4<'_, f32>,
        weights: Option<ArrayView3<'_, f32>>,
    ) -> TrainingResult<CostEvaluation> {
        self.compute(logits, labels, weights, false)
    }

    /// Same as `evaluate`, also returning the gradient with respect to `logits`.
    pub fn evaluate_with_gradient(
        self,
        logits: ArrayView4<'_, f32>,
        labels: ArrayView4<'_, f32>,
        weights: Option<ArrayView3<'_, f32>>,
    ) -> TrainingResult<CostEvaluation> {
        self.compute(logits, labels, weights, true)
    }

    fn compute(
        self,
        logits: ArrayView4<'_, f32>,
        labels: ArrayView4<'_, f32>,
        weights: Option<ArrayView3<'_, f32>>,
        with_gradient: bool,
    ) -> TrainingResult<CostEvaluation> {
        if logits.shape() != labels.shape() {
            return Err(TrainingError::Model(format!(
                "logits have shape {:?}, labels {:?}",
                logits.shape(),
                labels.shape()
            )));
        }
        let (n, h, w, classes) = logits.dim();
        let weights = match (self, weights) {
            (Self::Weighted, Some(weights)) if weights.dim() == (n, h, w) => Some(weights),
            (Self::Weighted, Some(weights)) => {
                return Err(TrainingError::Dataset(format!(
                    "weight map has shape {:?}, expected {:?}",
                    weights.shape(),
                    [n, h, w]
                )));
            }
            (Self::Weighted, None) => {
                return Err(TrainingError::Dataset("weighted cost requires a weight map".to_string()));
            }
            (Self::Unweighted, _) => None,
        };

        let pixels = n * h * w;
        if pixels == 0 || classes == 0 {
            return Err(TrainingError::Dataset("cannot evaluate an empty batch".to_string()));
        }
        let scale = 1.0 / pixels as f32;

        let mut grad = with_gradient.then(|| Array4::<f32>::zeros(logits.raw_dim()));
        let mut probs = vec![0.0f32; classes];
        let mut total = 0.0f64;
        let mut correct = 0usize;

        for b in 0..n {
            for y in 0..h {
                for x in 0..w {
                    let logit = logits.slice(s![b, y, x, ..]);
                    let label = labels.slice(s![b, y, x, ..]);
                    let weight = weights.map_or(1.0, |m| m[[b, y, x]]);

                    let log_norm = softmax_into(logit, &mut probs);
                    let mut entropy = 0.0f32;
                    let mut label_mass = 0.0f32;
                    for k in 0..classes {
                        if label[k] != 0.0 {
                            entropy -= label[k] * (logit[k] - log_norm);
                        }
                        label_mass += label[k];
                    }
                    total += f64::from(entropy * weight);

                    if argmax(logit) == argmax(label) {
                        correct += 1;
                    }

                    if let Some(grad) = grad.as_mut() {
                        for k in 0..classes {
                            grad[[b, y, x, k]] = (probs[k] * label_mass - label[k]) * weight * scale;
                        }
                    }
                }
            }
        }

        Ok(CostEvaluation {
            loss: (total / pixels as f64) as f32,
            accuracy: correct as f32 / pixels as f32,
            grad_logits: grad,
        })
    }
}

/// Writes `softmax(logit)` into `probs` and returns `log(sum(exp(logit)))`.
fn softmax_into(logit: ArrayView1<'_, f32>, probs: &mut [f32]) -> f32 {
    let max = logit.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (p, &z) in probs.iter_mut().zip(logit.iter()) {
        *p = (z - max).exp();
        sum += *p;
    }
    for p in probs.iter_mut() {
        *p /= sum;
    }
    max + sum.ln()
}

/// Index of the first maximum.
fn argmax(values: ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
