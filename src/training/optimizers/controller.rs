//! Cyclical learning rate control with warm restarts

use serde::{Deserialize, Serialize};
use tracing::info;

use super::schedulers::{create_scheduler, ScheduleState, Scheduler};
use crate::error::{Error, Result};
use crate::training::config::SchedulerConfig;

/// Schedule position stored in checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStateDict {
    /// Curve name, checked on restore
    pub scheduler: String,

    /// Cycle position
    pub state: ScheduleState,
}

/// Drives a learning rate curve across the run
///
/// The controller owns the current [`ScheduleState`]. At each configured
/// restart epoch the state is replaced by a fresh one whose cycle spans the
/// epochs up to the next restart boundary (or the end of the run for the
/// last boundary). Cycle lengths are counted in minibatches when the schedule
/// steps per minibatch and in epochs otherwise.
pub struct ScheduleController {
    scheduler: Box<dyn Scheduler>,
    state: ScheduleState,
    restart_epochs: Vec<usize>,
    num_epochs: usize,
    steps_per_epoch: usize,
    per_minibatch: bool,
}

impl ScheduleController {
    /// Create a controller for a run of `num_epochs` epochs of `steps_per_epoch` minibatches
    pub fn new(
        config: &SchedulerConfig,
        base_lr: f64,
        num_epochs: usize,
        steps_per_epoch: usize,
    ) -> Self {
        Self::with_scheduler(
            create_scheduler(&config.scheduler_type, base_lr),
            config.restart_epochs.clone(),
            config.lr_minibatch,
            num_epochs,
            steps_per_epoch,
        )
    }

    /// Create a controller around an explicit curve
    pub fn with_scheduler(
        scheduler: Box<dyn Scheduler>,
        restart_epochs: Vec<usize>,
        per_minibatch: bool,
        num_epochs: usize,
        steps_per_epoch: usize,
    ) -> Self {
        let first_cycle_epochs = match restart_epochs.first() {
            Some(&first) if first > 1 => first - 1,
            _ => num_epochs,
        };
        let mut controller = Self {
            scheduler,
            state: ScheduleState::new(1, None),
            restart_epochs,
            num_epochs,
            steps_per_epoch: steps_per_epoch.max(1),
            per_minibatch,
        };
        controller.state = ScheduleState::new(controller.epochs_to_steps(first_cycle_epochs), None);
        controller
    }

    fn epochs_to_steps(&self, epochs: usize) -> usize {
        if self.per_minibatch {
            epochs * self.steps_per_epoch
        } else {
            epochs
        }
    }

    /// Whether the schedule is stepped after every minibatch
    pub fn per_minibatch(&self) -> bool {
        self.per_minibatch
    }

    /// Current cycle position
    pub fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// Current learning rate
    pub fn lr(&self) -> f64 {
        self.scheduler.lr_at(&self.state)
    }

    /// Advance one schedule step and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.state.step += 1;
        self.lr()
    }

    /// Cycle span in epochs for a restart at `epoch`
    fn restart_span(&self, epoch: usize) -> Option<usize> {
        let idx = self.restart_epochs.iter().position(|&e| e == epoch)?;
        let span = match self.restart_epochs.get(idx + 1) {
            Some(&next) => next - epoch,
            None => (self.num_epochs + 1).saturating_sub(epoch),
        };
        Some(span)
    }

    /// Start a new cycle if `epoch` is a restart boundary
    ///
    /// Returns the replacement state when a restart happened.
    pub fn warm_restart(&mut self, epoch: usize) -> Option<ScheduleState> {
        let span = self.restart_span(epoch)?;
        let previous = self.state;
        self.state = ScheduleState::new(self.epochs_to_steps(span), Some(epoch));
        info!(
            epoch,
            cycle_steps = self.state.cycle_steps,
            previous_step = previous.step,
            "Warm learning rate restart at epoch {}! New cycle spans {} epochs",
            epoch,
            span
        );
        Some(self.state)
    }

    /// Get schedule state for checkpointing
    pub fn state_dict(&self) -> ScheduleStateDict {
        ScheduleStateDict {
            scheduler: self.scheduler.name().to_string(),
            state: self.state,
        }
    }

    /// Load schedule state from checkpoint
    pub fn load_state_dict(&mut self, dict: ScheduleStateDict) -> Result<()> {
        if dict.scheduler != self.scheduler.name() {
            return Err(Error::config(format!(
                "checkpoint holds {} schedule state, run uses {}",
                dict.scheduler,
                self.scheduler.name()
            )));
        }
        self.state = ScheduleState::new(dict.state.cycle_steps, dict.state.last_restart_epoch);
        self.state.step = dict.state.step;
        Ok(())
    }
}
