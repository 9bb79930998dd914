//! Worker topology and collective operations
//!
//! Every worker runs the same training loop in lock-step. The trainer talks to
//! its peers only through [`DistributedContext`]: gathering predictions in rank
//! order, barriers around checkpoint files, and broadcasting loop decisions
//! taken on the primary worker.

pub mod local;
pub mod tcp;

pub use local::{LocalGroup, SingleProcess};
pub use tcp::TcpGroup;

use std::sync::Arc;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use tracing::info;

use crate::error::Result;
use crate::training::config::DistributedConfig;

/// Collective operations shared by all workers of a run
#[async_trait]
pub trait DistributedContext: Send + Sync {
    /// Number of workers, at least 1
    fn world_size(&self) -> usize;

    /// This worker's rank in `0..world_size`
    fn rank(&self) -> usize;

    /// Whether this worker writes checkpoints, accumulates predictions and
    /// prints console-visible progress
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Concatenate `tensor` from every worker along dim 0, in rank order
    async fn all_gather(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Block until every worker reaches this point
    async fn synchronize(&self) -> Result<()>;

    /// Share the primary worker's `flag` with every worker
    async fn broadcast_flag(&self, flag: bool) -> Result<bool> {
        if self.world_size() == 1 {
            return Ok(flag);
        }
        let local = Tensor::new(&[u8::from(flag)], &Device::Cpu)?;
        let gathered = self.all_gather(&local).await?.to_vec1::<u8>()?;
        Ok(gathered.first().copied().unwrap_or(0) != 0)
    }
}

/// Build the context described by `config`
///
/// A world size of 1 yields [`SingleProcess`]; anything larger joins a
/// [`TcpGroup`] rendezvous.
pub async fn create_context(config: &DistributedConfig) -> Result<Arc<dyn DistributedContext>> {
    if config.world_size <= 1 {
        return Ok(Arc::new(SingleProcess));
    }
    info!(
        rank = config.rank,
        world_size = config.world_size,
        "Joining process group at {}:{}",
        config.master_addr,
        config.master_port
    );
    let group = TcpGroup::connect(config).await?;
    Ok(Arc::new(group))
}
