//! Learning rate curves
//!
//! A curve maps a [`ScheduleState`] to a learning rate and holds no mutable
//! state of its own. The position within the current cycle lives entirely
//! in the state value, so a warm restart is a matter of swapping that value.

use serde::{Deserialize, Serialize};

use crate::training::config::SchedulerType;

/// Position within the current learning rate cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// Number of schedule steps spanned by the current cycle
    pub cycle_steps: usize,

    /// Steps taken since the cycle started
    pub step: usize,

    /// Epoch at which the current cycle was started by a warm restart
    pub last_restart_epoch: Option<usize>,
}

impl ScheduleState {
    /// Fresh cycle of `cycle_steps` steps
    pub fn new(cycle_steps: usize, last_restart_epoch: Option<usize>) -> Self {
        Self {
            cycle_steps: cycle_steps.max(1),
            step: 0,
            last_restart_epoch,
        }
    }

    /// Fraction of the cycle completed, clamped to `[0, 1]`
    pub fn progress(&self) -> f64 {
        (self.step as f64 / self.cycle_steps as f64).min(1.0)
    }
}

/// Trait for learning rate curves
pub trait Scheduler: Send + Sync {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Learning rate at a cycle position
    fn lr_at(&self, state: &ScheduleState) -> f64;
}

/// Cosine interpolation from `start` (p = 0) to `end` (p = 1)
fn cosine_anneal(start: f64, end: f64, pct: f64) -> f64 {
    end + (start - end) / 2.0 * (1.0 + (std::f64::consts::PI * pct).cos())
}

/// One-cycle policy: cosine rise from `max_lr / div_factor` to `max_lr` over
/// the first `pct_start` of the cycle, then cosine decay to
/// `max_lr / (div_factor * final_div_factor)`
#[derive(Debug, Clone)]
pub struct OneCycleScheduler {
    max_lr: f64,
    pct_start: f64,
    initial_lr: f64,
    min_lr: f64,
}

impl OneCycleScheduler {
    /// Create a new one-cycle curve
    pub fn new(max_lr: f64, pct_start: f64, div_factor: f64, final_div_factor: f64) -> Self {
        let initial_lr = max_lr / div_factor;
        Self {
            max_lr,
            pct_start,
            initial_lr,
            min_lr: initial_lr / final_div_factor,
        }
    }

    /// Learning rate at the first step of a cycle
    pub fn initial_lr(&self) -> f64 {
        self.initial_lr
    }

    /// Learning rate at the end of a cycle
    pub fn min_lr(&self) -> f64 {
        self.min_lr
    }
}

impl Scheduler for OneCycleScheduler {
    fn name(&self) -> &str {
        "one_cycle"
    }

    fn lr_at(&self, state: &ScheduleState) -> f64 {
        let pct = state.progress();
        if pct < self.pct_start {
            cosine_anneal(self.initial_lr, self.max_lr, pct / self.pct_start)
        } else {
            let decay = (pct - self.pct_start) / (1.0 - self.pct_start);
            cosine_anneal(self.max_lr, self.min_lr, decay)
        }
    }
}

/// Cosine annealing learning rate curve
#[derive(Debug, Clone)]
pub struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
}

impl CosineScheduler {
    /// Create a new cosine curve
    pub fn new(base_lr: f64, min_lr: f64) -> Self {
        Self { base_lr, min_lr }
    }
}

impl Scheduler for CosineScheduler {
    fn name(&self) -> &str {
        "cosine"
    }

    fn lr_at(&self, state: &ScheduleState) -> f64 {
        cosine_anneal(self.base_lr, self.min_lr, state.progress())
    }
}

/// Constant learning rate
#[derive(Debug, Clone)]
pub struct ConstantScheduler {
    lr: f64,
}

impl ConstantScheduler {
    /// Create a new constant curve
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Scheduler for ConstantScheduler {
    fn name(&self) -> &str {
        "constant"
    }

    fn lr_at(&self, _state: &ScheduleState) -> f64 {
        self.lr
    }
}

/// Build the curve for a scheduler configuration
pub fn create_scheduler(scheduler_type: &SchedulerType, base_lr: f64) -> Box<dyn Scheduler> {
    match scheduler_type {
        SchedulerType::OneCycle {
            max_lr,
            pct_start,
            div_factor,
            final_div_factor,
        } => Box::new(OneCycleScheduler::new(*max_lr, *pct_start, *div_factor, *final_div_factor)),
        SchedulerType::Cosine { min_lr } => Box::new(CosineScheduler::new(base_lr, *min_lr)),
        SchedulerType::Constant => Box::new(ConstantScheduler::new(base_lr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn at(step: usize, cycle_steps: usize) -> ScheduleState {
        ScheduleState {
            cycle_steps,
            step,
            last_restart_epoch: None,
        }
    }

    #[test]
    fn test_one_cycle_shape() {
        let scheduler = OneCycleScheduler::new(1.0, 0.25, 25.0, 100.0);

        assert_relative_eq!(scheduler.lr_at(&at(0, 100)), 0.04, epsilon = 1e-12);
        assert_relative_eq!(scheduler.lr_at(&at(25, 100)), 1.0, epsilon = 1e-12);
        assert_relative_eq!(scheduler.lr_at(&at(100, 100)), 0.0004, epsilon = 1e-12);

        // Rising during warmup, falling afterwards
        assert!(scheduler.lr_at(&at(10, 100)) < scheduler.lr_at(&at(20, 100)));
        assert!(scheduler.lr_at(&at(50, 100)) > scheduler.lr_at(&at(80, 100)));
    }

    #[test]
    fn test_progress_is_clamped() {
        let scheduler = CosineScheduler::new(0.1, 0.01);
        assert_relative_eq!(scheduler.lr_at(&at(150, 100)), 0.01, epsilon = 1e-12);
        assert_relative_eq!(scheduler.lr_at(&at(50, 100)), 0.055, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_length_cycle_is_widened() {
        let state = ScheduleState::new(0, Some(3));
        assert_eq!(state.cycle_steps, 1);
        assert_eq!(state.step, 0);
    }

    #[test]
    fn test_constant() {
        let scheduler = create_scheduler(&SchedulerType::Constant, 0.3);
        assert_eq!(scheduler.name(), "constant");
        assert_eq!(scheduler.lr_at(&at(7, 10)), 0.3);
    }
}
