//! Single-process and in-process worker groups

use std::sync::Arc;

use async_trait::async_trait;
use candle_core::Tensor;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use super::DistributedContext;
use crate::error::{Error, Result};

/// The only worker of a run; every collective is an identity or no-op
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

#[async_trait]
impl DistributedContext for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    async fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    async fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// One member of a group of workers living in the same process
///
/// Workers are typically driven as separate tokio tasks. Gathers exchange
/// tensors through shared slots guarded by two barriers: the first makes every
/// contribution visible, the second keeps a fast worker from overwriting its
/// slot before a slow one has read it.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create all `world_size` members of a new group, indexed by rank
    pub fn new_group(world_size: usize) -> Vec<LocalGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size]),
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl DistributedContext for LocalGroup {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    async fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
        self.shared.slots.lock()[self.rank] = Some(tensor.clone());
        self.shared.barrier.wait().await;

        let parts: Option<Vec<Tensor>> = self.shared.slots.lock().iter().cloned().collect();
        self.shared.barrier.wait().await;

        let parts = parts.ok_or_else(|| Error::distributed("gather slot left empty by a peer"))?;
        Ok(Tensor::cat(&parts, 0)?)
    }

    async fn synchronize(&self) -> Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }
}
