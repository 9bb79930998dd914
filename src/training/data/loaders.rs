//! Sharded, seeded minibatch loader

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Batch, BatchLoader, Dataset};
use crate::error::Result;

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle data each epoch
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Base seed; the epoch number is added to it for each shuffle
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: false,
            drop_last: false,
            seed: 0,
        }
    }
}

/// Minibatch loader over one worker's shard of a dataset
///
/// With several workers the sample order is padded by wrapping around to the
/// front until it divides evenly, then dealt out round-robin, so every worker
/// sees the same number of samples and minibatches. Worker `r` gets positions
/// `r, r + world_size, r + 2 * world_size, ...`, so gathered predictions
/// come back interleaved by rank rather than in dataset order.
pub struct DataLoader<D: Dataset> {
    dataset: Arc<D>,
    config: DataLoaderConfig,
    rank: usize,
    world_size: usize,
    batches: Vec<Vec<usize>>,
    cursor: usize,
}

impl<D: Dataset> DataLoader<D> {
    /// Loader for a single worker
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig) -> Self {
        Self::sharded(dataset, config, 0, 1)
    }

    /// Loader for worker `rank` of `world_size`
    pub fn sharded(dataset: Arc<D>, config: DataLoaderConfig, rank: usize, world_size: usize) -> Self {
        let mut loader = Self {
            dataset,
            config,
            rank,
            world_size: world_size.max(1),
            batches: Vec::new(),
            cursor: 0,
        };
        loader.start_epoch(0);
        loader
    }

    /// Sample order of this worker for `epoch`
    fn shard_indices(&self, epoch: usize) -> Vec<usize> {
        let len = self.dataset.len();
        if len == 0 {
            return Vec::new();
        }

        let mut order: Vec<usize> = (0..len).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }

        let total = len.div_ceil(self.world_size) * self.world_size;
        let padded: Vec<usize> = order.iter().copied().cycle().take(total).collect();

        padded
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    /// Samples in one worker's shard
    pub fn shard_len(&self) -> usize {
        self.dataset.len().div_ceil(self.world_size)
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }
}

impl<D: Dataset> BatchLoader for DataLoader<D> {
    fn num_batches(&self) -> usize {
        let batch_size = self.config.batch_size.max(1);
        let shard = self.shard_len();
        if self.config.drop_last {
            shard / batch_size
        } else {
            shard.div_ceil(batch_size)
        }
    }

    fn start_epoch(&mut self, epoch: usize) {
        let batch_size = self.config.batch_size.max(1);
        let indices = self.shard_indices(epoch);
        self.batches = indices
            .chunks(batch_size)
            .filter(|chunk| !self.config.drop_last || chunk.len() == batch_size)
            .map(<[usize]>::to_vec)
            .collect();
        self.cursor = 0;
        debug!(
            epoch,
            rank = self.rank,
            batches = self.batches.len(),
            "Prepared minibatch order"
        );
    }

    fn skip(&mut self, n: usize) -> usize {
        let skipped = n.min(self.batches.len() - self.cursor);
        self.cursor += skipped;
        skipped
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let Some(indices) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        let batch = self.dataset.get_batch(indices)?;
        self.cursor += 1;
        Ok(Some(batch))
    }
}
