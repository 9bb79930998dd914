//! Optimizers and learning rate scheduling
//!
//! Optimizers update the variables of a [`candle_nn::VarMap`] from the
//! gradients of a backward pass. The learning rate is owned by the
//! [`ScheduleController`], which the trainer consults after every schedule
//! step and pushes into the optimizer.

pub mod adamw;
pub mod controller;
pub mod schedulers;
pub mod sgd;

pub use adamw::AdamWOptimizer;
pub use controller::{ScheduleController, ScheduleStateDict};
pub use schedulers::{ConstantScheduler, CosineScheduler, OneCycleScheduler, ScheduleState, Scheduler};
pub use sgd::SGDOptimizer;

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::checkpoints::TensorState;
use crate::training::config::{OptimizerConfig, OptimizerType};

/// Trait for optimizers
pub trait Optimizer: Send + Sync {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from the gradients of a backward pass
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Get current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Get optimizer state for checkpointing
    fn state_dict(&self) -> Result<OptimizerStateDict>;

    /// Load optimizer state from checkpoint
    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()>;

    /// Number of optimized variables
    fn parameter_count(&self) -> usize;

    /// Get current step count
    fn step_count(&self) -> usize;
}

/// Optimizer state dictionary for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStateDict {
    /// Optimizer type
    pub optimizer_type: String,

    /// Current step count
    pub step_count: usize,

    /// Current learning rate
    pub learning_rate: f64,

    /// Per-variable buffers keyed by `<variable>.<buffer>`
    pub state: BTreeMap<String, TensorState>,

    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, f64>,
}

impl OptimizerStateDict {
    /// Ensure the dictionary was produced by the optimizer named `expected`
    pub fn check_type(&self, expected: &str) -> Result<()> {
        if self.optimizer_type != expected {
            return Err(Error::config(format!(
                "checkpoint holds {} optimizer state, run uses {}",
                self.optimizer_type, expected
            )));
        }
        Ok(())
    }
}

/// Variables of `var_map` sorted by name
pub(crate) fn sorted_vars(var_map: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|_| Error::model("parameter map lock poisoned"))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Restore a per-variable buffer onto the device and dtype of `var`
pub(crate) fn restore_buffer(state: &TensorState, var: &Var) -> Result<candle_core::Tensor> {
    if state.shape != var.dims() {
        return Err(Error::model(format!(
            "optimizer buffer shape {:?} does not match variable shape {:?}",
            state.shape,
            var.dims()
        )));
    }
    Ok(state.to_tensor(var.device())?.to_dtype(var.dtype())?)
}

/// Create the optimizer described by `config` over every variable of `var_map`
pub fn create_optimizer(config: &OptimizerConfig, var_map: &VarMap) -> Result<Box<dyn Optimizer>> {
    let optimizer: Box<dyn Optimizer> = match config.optimizer_type {
        OptimizerType::AdamW => Box::new(AdamWOptimizer::new(
            var_map,
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )?),
        OptimizerType::Sgd { momentum } => Box::new(SGDOptimizer::new(
            var_map,
            config.learning_rate,
            momentum,
            config.weight_decay,
        )?),
    };
    Ok(optimizer)
}
