//! Step and epoch counters of a run, and the cadence predicates evaluated each step.

use serde::{Deserialize, Serialize};

/// True when `step` closes an epoch of `epoch_size` steps.
#[must_use]
pub fn is_epoch_boundary(step: u64, epoch_size: u64) -> bool {
    epoch_size > 0 && step % epoch_size == 0
}

/// True when `step` is a checkpoint/history/report save point.
#[must_use]
pub fn is_save_boundary(step: u64, save_step: u64) -> bool {
    save_step > 0 && step % save_step == 0
}

/// True when the current minibatch should be logged.
#[must_use]
pub fn is_display_boundary(step: u64, display_step: u64) -> bool {
    display_step > 0 && step % display_step == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    /// 1-based, monotonic, never reset during a run.
    pub step: u64,
    /// The epoch in progress.
    pub epoch: u32,
    /// Steps per epoch (size of the training set).
    pub epoch_size: u64,
    pub max_epoch: u32,
}

impl TrainingState {
    /// State of a run whose history already holds `resumed_epoch` epochs.
    #[must_use]
    pub fn new(epoch_size: u64, max_epoch: u32, resumed_epoch: u32) -> Self {
        Self { step: 1, epoch: resumed_epoch + 1, epoch_size, max_epoch }
    }

    #[must_use]
    pub fn should_continue(&self) -> bool {
        self.epoch < self.max_epoch
    }

    #[must_use]
    pub fn at_epoch_boundary(&self) -> bool {
        is_epoch_boundary(self.step, self.epoch_size)
    }

    /// The most recent fully completed epoch (0 if none).
    #[must_use]
    pub fn completed_epoch(&self) -> u32 {
        self.epoch - 1
    }

    pub fn complete_epoch(&mut self) {
        self.epoch += 1;
    }

    pub fn advance_step(&mut self) {
        self.step += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries_are_independent() {
        assert!(is_epoch_boundary(4, 2));
        assert!(!is_epoch_boundary(3, 2));
        assert!(is_save_boundary(600, 600));
        assert!(!is_save_boundary(4, 600));
        assert!(!is_epoch_boundary(5, 0));
        assert!(is_display_boundary(200, 100));
    }

    #[test]
    fn test_fresh_and_resumed_state() {
        let fresh = TrainingState::new(10, 2500, 0);
        assert_eq!((fresh.step, fresh.epoch, fresh.completed_epoch()), (1, 1, 0));

        let resumed = TrainingState::new(10, 2500, 7);
        assert_eq!((resumed.step, resumed.epoch, resumed.completed_epoch()), (1, 8, 7));
    }

    #[test]
    fn test_epoch_advances_once_per_epoch_size_steps() {
        let mut state = TrainingState::new(3, 100, 0);
        for _ in 0..9 {
            if state.at_epoch_boundary() {
                state.complete_epoch();
            }
            state.advance_step();
        }
        assert_eq!(state.step, 10);
        assert_eq!(state.epoch, 4);
    }

    #[test]
    fn test_should_continue_stops_at_max_epoch() {
        let mut state = TrainingState::new(1, 3, 0);
        assert!(state.should_continue());
        state.complete_epoch();
        assert!(state.should_continue());
        state.complete_epoch();
        assert!(!state.should_continue());
    }
}
