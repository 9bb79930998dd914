//! Error types for the Pelican trainer

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested checkpoint slot has never been written
    #[error("No {slot} checkpoint found at {}", path.display())]
    CheckpointNotFound {
        /// Slot name
        slot: String,
        /// Expected file location
        path: PathBuf,
    },

    /// Checkpoint file exists but cannot be decoded or applied
    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint {
        /// File that failed to decode
        path: PathBuf,
        /// Decoder message
        reason: String,
    },

    /// Collective communication failure (gather or barrier)
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Model contract violation
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Binary encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// CSV export error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for training operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a distributed communication error
    pub fn distributed(msg: impl Into<String>) -> Self {
        Self::Distributed(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a corrupt checkpoint error
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::CorruptCheckpoint {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error only signals a missing checkpoint
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CheckpointNotFound { .. })
    }
}
