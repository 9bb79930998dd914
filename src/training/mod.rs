//! Training infrastructure for resumable classifier runs
//!
//! # Main Components
//!
//! - **Configuration**: serde-backed run configuration with environment overlay
//! - **Trainer**: epoch loop with exact-minibatch resume, best-slot tracking,
//!   early stopping and trial pruning
//! - **Checkpoints**: `latest`, `best-loss` and `best-accuracy` slots
//! - **Optimizers**: AdamW and SGD driven by a cyclical schedule with warm restarts
//! - **Distributed**: lock-step workers with rank-ordered gathers and barriers
//! - **Metrics**: classifier metrics, minibatch smoothing and CSV export
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pelican_trainer::training::{Trainer, TrainingConfig, Split};
//!
//! let mut trainer = Trainer::builder(config)
//!     .model(Box::new(model))
//!     .loader(Split::Train, Box::new(train_loader))
//!     .loader(Split::Valid, Box::new(valid_loader))
//!     .build()?;
//!
//! trainer.load_checkpoint().await?;
//! let outcome = trainer.train(None).await?;
//! let report = trainer.evaluate(&[Split::Valid, Split::Test], true, true).await?;
//! ```

pub mod checkpoints;
pub mod config;
pub mod context;
pub mod data;
pub mod distributed;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizers;
pub mod trainer;
pub mod trial;

#[cfg(test)]
pub mod tests;

pub use checkpoints::{CheckpointRecord, CheckpointSlot, CheckpointStore, ModelState, TensorState};
pub use config::{
    CheckpointingConfig, DataConfig, DistributedConfig, ModelConfig, OptimizerConfig, OptimizerType,
    OutputConfig, SchedulerConfig, SchedulerType, SummarizeCsv, TrainingConfig, TrainingParams,
};
pub use context::LogContext;
pub use data::{load_splits, Batch, BatchLoader, DataLoader, DataLoaderConfig, Dataset, Split, TensorDataset};
pub use distributed::{create_context, DistributedContext, LocalGroup, SingleProcess, TcpGroup};
pub use loss::{CrossEntropyLoss, Loss, SmoothingSchedule};
pub use metrics::{ClassifierMetrics, Metrics, MetricsAggregator, MetricsCsv, MetricsFn};
pub use model::{Model, ModelOutput, PREDICT_KEY};
pub use optimizers::{
    create_optimizer, AdamWOptimizer, Optimizer, OptimizerStateDict, SGDOptimizer, ScheduleController,
    ScheduleState, Scheduler,
};
pub use trainer::{
    BestRecord, EpochSummary, EvaluationReport, Prediction, SlotEvaluation, Trainer, TrainerBuilder,
    TrainingEvent, TrainingOutcome, TrainingState, TrainingSummary,
};
pub use trial::Trial;
