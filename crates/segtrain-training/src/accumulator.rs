/// Per-step training loss and accuracy of the epoch in progress.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    losses: Vec<f32>,
    accuracies: Vec<f32>,
}

impl EpochAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, loss: f32, accuracy: f32) {
        self.losses.push(loss);
        self.accuracies.push(accuracy);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.losses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    /// Returns `(mean loss, mean accuracy)` and clears both sequences.
    /// `None` if nothing was recorded since the last flush.
    pub fn flush(&mut self) -> Option<(f32, f32)> {
        if self.losses.is_empty() {
            return None;
        }
        let means = (mean(&self.losses), mean(&self.accuracies));
        self.losses.clear();
        self.accuracies.clear();
        Some(means)
    }
}

fn mean(values: &[f32]) -> f32 {
    let sum: f64 = values.iter().map(|&v| f64::from(v)).sum();
    (sum / values.len() as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_returns_means_and_clears() {
        let mut acc = EpochAccumulator::new();
        acc.record(1.0, 0.5);
        acc.record(3.0, 0.75);

        assert_eq!(acc.flush(), Some((2.0, 0.625)));
        assert!(acc.is_empty());
        assert_eq!(acc.flush(), None);
    }

    #[test]
    fn test_flush_only_covers_records_since_last_flush() {
        let mut acc = EpochAccumulator::new();
        acc.record(10.0, 0.0);
        let _ = acc.flush();
        acc.record(0.5, 1.0);
        assert_eq!(acc.flush(), Some((0.5, 1.0)));
    }
}
