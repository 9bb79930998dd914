//! Checkpoint slots and their on-disk records
//!
//! Three independent slots are kept per run: `latest` (overwritten every
//! epoch), `best-loss` (written on strict validation loss improvement) and
//! `best-accuracy` (written on strict validation accuracy improvement). All
//! three share the same [`CheckpointRecord`] layout.

pub mod state;
pub mod store;

pub use state::{HalfPrecision, ModelState, TensorData, TensorState};
pub use store::CheckpointStore;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::training::config::TrainingConfig;
use crate::training::metrics::Metrics;
use crate::training::optimizers::{OptimizerStateDict, ScheduleStateDict};
use crate::training::trainer::{BestRecord, TrainingState};

/// Metric key compared for the `best-loss` slot
pub const LOSS_KEY: &str = "loss";

/// Metric key compared for the `best-accuracy` slot
pub const ACCURACY_KEY: &str = "accuracy";

/// Named checkpoint slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CheckpointSlot {
    /// Most recent training position
    Latest,
    /// Lowest validation loss so far
    BestLoss,
    /// Highest validation accuracy so far
    BestAccuracy,
}

impl CheckpointSlot {
    /// All slots in evaluation order
    pub const ALL: [CheckpointSlot; 3] = [Self::Latest, Self::BestLoss, Self::BestAccuracy];

    /// Slot name as it appears in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::BestLoss => "best-loss",
            Self::BestAccuracy => "best-accuracy",
        }
    }

    /// File name suffix appended to the run prefix
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Self::Latest => "",
            Self::BestLoss => ".best-loss",
            Self::BestAccuracy => ".best-accuracy",
        }
    }

    /// Label used in evaluation log lines and summary CSV names
    pub fn description(&self) -> &'static str {
        match self {
            Self::Latest => "Final",
            Self::BestLoss => "Best",
            Self::BestAccuracy => "BestAcc",
        }
    }

    /// Tag used in prediction file names
    pub fn prediction_tag(&self) -> &'static str {
        match self {
            Self::Latest => "final",
            Self::BestLoss => "best",
            Self::BestAccuracy => "bestacc",
        }
    }

    /// Whether `candidate` strictly beats the current holder of this slot
    ///
    /// Ties keep the earlier record. `Latest` always accepts.
    pub fn improves(&self, candidate: &Metrics, current: Option<&BestRecord>) -> bool {
        match self {
            Self::Latest => true,
            Self::BestLoss => match candidate.get(LOSS_KEY) {
                Some(&loss) => current
                    .and_then(|best| best.metrics.get(LOSS_KEY).copied())
                    .map_or(!loss.is_nan(), |best| loss < best),
                None => false,
            },
            Self::BestAccuracy => match candidate.get(ACCURACY_KEY) {
                Some(&accuracy) => current
                    .and_then(|best| best.metrics.get(ACCURACY_KEY).copied())
                    .map_or(!accuracy.is_nan(), |best| accuracy > best),
                None => false,
            },
        }
    }
}

impl fmt::Display for CheckpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Full training snapshot stored in every slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Configuration the run was started with
    pub config: TrainingConfig,

    /// Model parameters
    pub model_state: ModelState,

    /// Optimizer moments and step count
    pub optimizer_state: OptimizerStateDict,

    /// Learning rate schedule position
    pub schedule_state: ScheduleStateDict,

    /// Epoch, minibatch, smoothed metrics and best trackers
    pub training_state: TrainingState,

    /// Time the record was written
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Training position encoded in the record
    pub fn position(&self) -> (usize, usize) {
        (self.training_state.epoch, self.training_state.minibatch)
    }
}
