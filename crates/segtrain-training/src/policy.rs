//! Decides when a validation record replaces the best checkpoint.
//!
//! The rule is strict dominance: a record is promoted only if its accuracy is
//! strictly higher *and* its loss strictly lower than the stored best. Ties and
//! mixed improvements never promote. The first record is adopted as the baseline
//! without a promotion, so a very poor first epoch can block promotions that only
//! improve one axis.

use crate::history::MetricRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestModelState {
    pub best_accuracy: f32,
    pub best_loss: f32,
    pub epoch: u32,
}

#[derive(Debug, Clone, Default)]
pub struct BestModelPolicy {
    best: Option<BestModelState>,
}

impl BestModelPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the policy state by evaluating `records` in order.
    #[must_use]
    pub fn replay<'a>(records: impl IntoIterator<Item = &'a MetricRecord>) -> Self {
        let mut policy = Self::new();
        for record in records {
            policy.evaluate(record);
        }
        policy
    }

    #[must_use]
    pub fn best(&self) -> Option<&BestModelState> {
        self.best.as_ref()
    }

    /// Returns `true` when `record` is a new best and the best checkpoint should be written.
    pub fn evaluate(&mut self, record: &MetricRecord) -> bool {
        let candidate = BestModelState {
            best_accuracy: record.accuracy,
            best_loss: record.loss,
            epoch: record.epoch,
        };

        match self.best {
            None => {
                self.best = Some(candidate);
                false
            }
            Some(best) if record.accuracy > best.best_accuracy && record.loss < best.best_loss => {
                self.best = Some(candidate);
                true
            }
            Some(_) => false,
        }
    }
}
