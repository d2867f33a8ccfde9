//! Adam over named parameters, and the single optimizer step the run loop drives.

use crate::cost::Cost;
use crate::dataset::Batch;
use crate::error::{TrainingError, TrainingResult};
use crate::network::{Phase, SegmentationNetwork};
use crate::params::{Gradients, ParameterKind, ParameterSet};
use ndarray::{ArrayD, Zip, arr0};
use std::collections::BTreeMap;

const PREFIX: &str = "optimizer";
const BETA1_POWER: &str = "optimizer/beta1_power";
const BETA2_POWER: &str = "optimizer/beta2_power";

#[derive(Debug, Clone)]
struct Moments {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    moments: BTreeMap<String, Moments>,
}

impl Adam {
    /// Adam with the usual `beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`.
    #[must_use]
    pub fn new(learning_rate: f32) -> Self {
        Self::with_hyperparameters(learning_rate, 0.9, 0.999, 1e-8)
    }

    #[must_use]
    pub fn with_hyperparameters(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.0,
            beta2_t: 1.0,
            moments: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Applies one update to every parameter named in `grads`.
    pub fn apply(&mut self, params: &mut ParameterSet, grads: &Gradients) -> TrainingResult<()> {
        for (name, grad) in grads {
            let param = params
                .get(name)
                .ok_or_else(|| TrainingError::Model(format!("gradient for unknown parameter '{name}'")))?;
            if param.kind != ParameterKind::Trainable {
                return Err(TrainingError::Model(format!("gradient for non-trainable parameter '{name}'")));
            }
            if param.value.shape() != grad.shape() {
                return Err(TrainingError::Model(format!(
                    "gradient for '{name}' has shape {:?}, parameter {:?}",
                    grad.shape(),
                    param.value.shape()
                )));
            }
        }

        let Self { learning_rate: lr, beta1: b1, beta2: b2, epsilon: eps, .. } = *self;
        self.beta1_t *= b1;
        self.beta2_t *= b2;
        let step_size = lr * (1.0 - self.beta2_t).sqrt() / (1.0 - self.beta1_t);

        for (name, grad) in grads {
            let Some(value) = params.value_mut(name) else { continue };
            let moments = self.moments.entry(name.clone()).or_insert_with(|| Moments {
                m: ArrayD::zeros(grad.raw_dim()),
                v: ArrayD::zeros(grad.raw_dim()),
            });

            Zip::from(value)
                .and(grad)
                .and(&mut moments.m)
                .and(&mut moments.v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1.0 - b1) * g;
                    *v = b2 * *v + (1.0 - b2) * g * g;
                    *p -= step_size * *m / (v.sqrt() + eps);
                });
        }
        Ok(())
    }

    /// Moments and power accumulators as `Optimizer` parameters.
    #[must_use]
    pub fn state(&self) -> ParameterSet {
        let mut state = ParameterSet::new();
        state.insert(BETA1_POWER, ParameterKind::Optimizer, arr0(self.beta1_t).into_dyn());
        state.insert(BETA2_POWER, ParameterKind::Optimizer, arr0(self.beta2_t).into_dyn());
        for (name, moments) in &self.moments {
            state.insert(format!("{PREFIX}/{name}/m"), ParameterKind::Optimizer, moments.m.clone());
            state.insert(format!("{PREFIX}/{name}/v"), ParameterKind::Optimizer, moments.v.clone());
        }
        state
    }

    /// Replaces the optimizer state with the `Optimizer` entries of `snapshot`.
    ///
    /// Every trainable parameter of `model` must have both moments with its shape, unless
    /// the snapshot was taken before any update.
    pub fn load_state(&mut self, snapshot: &ParameterSet, model: &ParameterSet) -> Result<(), String> {
        let scalar = |name: &str| -> Result<f32, String> {
            let value = snapshot.value(name).ok_or_else(|| format!("optimizer state '{name}' is missing"))?;
            if value.len() != 1 {
                return Err(format!("optimizer state '{name}' is not a scalar"));
            }
            Ok(value.iter().copied().next().unwrap_or_default())
        };
        let beta1_t = scalar(BETA1_POWER)?;
        let beta2_t = scalar(BETA2_POWER)?;
        if beta1_t == 1.0 && beta2_t == 1.0 {
            // Saved before the first update.
            *self = Self::with_hyperparameters(self.learning_rate, self.beta1, self.beta2, self.epsilon);
            return Ok(());
        }

        let mut moments = BTreeMap::new();
        for (name, param) in model.iter().filter(|(_, p)| p.kind == ParameterKind::Trainable) {
            let moment = |suffix: &str| -> Result<ArrayD<f32>, String> {
                let key = format!("{PREFIX}/{name}/{suffix}");
                let value = snapshot.value(&key).ok_or_else(|| format!("optimizer state '{key}' is missing"))?;
                if value.shape() != param.value.shape() {
                    return Err(format!(
                        "optimizer state '{key}' has shape {:?}, expected {:?}",
                        value.shape(),
                        param.value.shape()
                    ));
                }
                Ok(value.clone())
            };
            moments.insert(name.clone(), Moments { m: moment("m")?, v: moment("v")? });
        }

        self.beta1_t = beta1_t;
        self.beta2_t = beta2_t;
        self.moments = moments;
        Ok(())
    }
}

/// Loss and pixel accuracy of one batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// Forward, cost, backward and Adam update for one minibatch.
#[derive(Debug, Clone)]
pub struct OptimizerStep {
    cost: Cost,
    adam: Adam,
}

impl OptimizerStep {
    #[must_use]
    pub fn new(cost: Cost, learning_rate: f32) -> Self {
        Self { cost, adam: Adam::new(learning_rate) }
    }

    #[must_use]
    pub fn cost(&self) -> Cost {
        self.cost
    }

    #[must_use]
    pub fn adam(&self) -> &Adam {
        &self.adam
    }

    pub fn adam_mut(&mut self) -> &mut Adam {
        &mut self.adam
    }

    /// Runs one training step on `batch`. A non-finite loss fails with `Divergence`
    /// before any parameter or statistic is touched.
    pub fn run(
        &mut self,
        network: &mut dyn SegmentationNetwork,
        batch: &Batch,
        keep_prob: f32,
        step: u64,
    ) -> TrainingResult<StepMetrics> {
        let logits = network.forward(batch.images.view(), Phase::Training { keep_prob })?;
        let eval = self.cost.evaluate_with_gradient(
            logits.view(),
            batch.labels.view(),
            batch.weights.as_ref().map(|w| w.view()),
        )?;
        if !eval.loss.is_finite() {
            return Err(TrainingError::Divergence { step, loss: eval.loss });
        }
        let grad_logits = eval
            .grad_logits
            .ok_or_else(|| TrainingError::Model("cost returned no gradient".to_string()))?;

        let grads = network.backward(grad_logits.view())?;
        network.commit_statistics();
        self.adam.apply(network.parameters_mut(), &grads)?;

        Ok(StepMetrics { loss: eval.loss, accuracy: eval.accuracy })
    }

    /// Loss and accuracy of `batch` in inference mode. Touches no parameters.
    pub fn evaluate(&self, network: &mut dyn SegmentationNetwork, batch: &Batch) -> TrainingResult<StepMetrics> {
        let logits = network.forward(batch.images.view(), Phase::Inference)?;
        let eval = self
            .cost
            .evaluate(logits.view(), batch.labels.view(), batch.weights.as_ref().map(|w| w.view()))?;
        Ok(StepMetrics { loss: eval.loss, accuracy: eval.accuracy })
    }
}
