//! Pelican trainer - resumable multi-worker classifier training
//!
//! This crate trains classifiers over many epochs with exact resumption from
//! the last finished minibatch, three checkpoint slots (latest, best loss,
//! best accuracy), cyclical learning rates with warm restarts and lock-step
//! distributed workers.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod logging;
pub mod models;
pub mod training;
pub mod utils;

pub use error::{Error, Result};
pub use models::MlpClassifier;
pub use training::{
    CheckpointSlot, CheckpointStore, DistributedContext, Trainer, TrainerBuilder, TrainingConfig,
    TrainingOutcome, TrainingState,
};
