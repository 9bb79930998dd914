//! Data loading for classifier training
//!
//! A [`Dataset`] hands out batches of named tensors by sample index; a
//! [`BatchLoader`] walks a dataset in a stable per-epoch order and can skip
//! ahead without materializing the skipped batches.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod datasets;
pub mod loaders;

pub use datasets::{load_splits, TensorDataset};
pub use loaders::{DataLoader, DataLoaderConfig};

/// Dataset partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    /// All splits
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    /// Short name used in file names
    pub fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    /// Padded label used in metric log lines
    pub fn label(&self) -> &'static str {
        match self {
            Split::Train => "Training  ",
            Split::Valid => "Validation",
            Split::Test => "Testing   ",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Split {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "valid" | "validation" => Ok(Split::Valid),
            "test" => Ok(Split::Test),
            other => Err(Error::data(format!("unknown split '{}'", other))),
        }
    }
}

/// A minibatch of named tensors sharing their leading dimension
#[derive(Debug, Clone, Default)]
pub struct Batch {
    tensors: BTreeMap<String, Tensor>,
}

impl Batch {
    /// Wrap named tensors
    pub fn new(tensors: BTreeMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Tensor stored under `name`
    pub fn get(&self, name: &str) -> Result<&Tensor> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::data(format!("batch has no field '{}'", name)))
    }

    /// Add or replace a field
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.tensors
            .values()
            .next()
            .and_then(|t| t.dims().first().copied())
            .unwrap_or(0)
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// Common trait for all training datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize the samples at `indices` as one batch
    fn get_batch(&self, indices: &[usize]) -> Result<Batch>;
}

/// Ordered minibatch source for one split
pub trait BatchLoader: Send + Sync {
    /// Minibatches per epoch on this worker
    fn num_batches(&self) -> usize;

    /// Rewind to the first minibatch of `epoch`, reshuffling if configured
    fn start_epoch(&mut self, epoch: usize);

    /// Advance past `n` minibatches without loading them; returns how many were skipped
    fn skip(&mut self, n: usize) -> usize;

    /// Load the next minibatch, or `None` at the end of the epoch
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}
