//! Training configuration for the classifier trainer
//!
//! Every knob the trainer reads lives here: data and batching, the optimizer,
//! the cyclical learning-rate schedule with its restart boundaries, the epoch
//! loop, checkpoint persistence, output files and the distributed topology.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils;

/// Main training configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Run name used to derive checkpoint and output file names
    pub prefix: String,

    /// Data configuration
    pub data: DataConfig,

    /// Reference model configuration
    pub model: ModelConfig,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Learning rate schedule configuration
    pub scheduler: SchedulerConfig,

    /// Epoch loop parameters
    pub training: TrainingParams,

    /// Checkpoint persistence
    pub checkpointing: CheckpointingConfig,

    /// Metrics and prediction outputs
    pub output: OutputConfig,

    /// Distributed topology
    pub distributed: DistributedConfig,
}

/// Data configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory containing `train.safetensors`, `valid.safetensors`, `test.safetensors`
    pub data_dir: PathBuf,

    /// Batch size per worker
    pub batch_size: usize,

    /// Shuffle the training split each epoch
    pub shuffle: bool,

    /// Name of the input tensor in each split file
    pub input_key: String,

    /// Name of the target tensor in each split file
    pub target_key: String,
}

/// Reference classifier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Hidden layer widths of the MLP classifier
    pub hidden_dims: Vec<usize>,

    /// Number of output classes
    pub num_classes: usize,
}

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,

    /// Base learning rate
    pub learning_rate: f64,

    /// Weight decay coefficient
    pub weight_decay: f64,

    /// Beta1 parameter for Adam-based optimizers
    pub beta1: f64,

    /// Beta2 parameter for Adam-based optimizers
    pub beta2: f64,

    /// Epsilon for numerical stability
    pub epsilon: f64,
}

/// Optimizer types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    AdamW,
    Sgd { momentum: f64 },
}

/// Learning rate schedule configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Curve followed within each cycle
    pub scheduler_type: SchedulerType,

    /// Epochs at which a new cycle starts, strictly increasing
    pub restart_epochs: Vec<usize>,

    /// Step the schedule once per minibatch instead of once per epoch
    pub lr_minibatch: bool,
}

/// Learning rate curves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    /// Cosine warmup to `max_lr` followed by cosine decay
    OneCycle {
        max_lr: f64,
        pct_start: f64,
        div_factor: f64,
        final_div_factor: f64,
    },
    /// Cosine annealing from the base learning rate to `min_lr`
    Cosine { min_lr: f64 },
    /// Base learning rate throughout
    Constant,
}

/// Epoch loop parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs
    pub num_epochs: usize,

    /// Seed for parameter init and data shuffling
    pub seed: u64,

    /// Stop after this many epochs without validation loss improvement
    pub patience: Option<usize>,

    /// Smoothing strength of the minibatch metrics EMA
    pub alpha: f64,

    /// Log a progress line every N minibatches (0 disables)
    pub log_every: usize,

    /// Save the latest checkpoint every N minibatches (0 disables)
    pub save_every: usize,

    /// Metric reported to a hyper-parameter search trial
    pub metric_to_report: String,
}

/// Checkpointing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingConfig {
    /// Directory holding the checkpoint slots
    pub model_dir: PathBuf,

    /// Write checkpoints
    pub save: bool,

    /// Resume from the latest checkpoint when present
    pub load: bool,
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for prediction files and per-split metrics CSVs
    pub predict_dir: PathBuf,

    /// Directory for run-level summary CSVs
    pub log_dir: PathBuf,

    /// Save predictions and targets as safetensors after each evaluation
    pub save_predictions: bool,

    /// Which metrics CSVs to write
    pub summarize_csv: SummarizeCsv,
}

/// Metrics CSV selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizeCsv {
    None,
    Test,
    All,
}

/// Distributed topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Number of workers
    pub world_size: usize,

    /// This worker's rank
    pub rank: usize,

    /// Address of the rank 0 rendezvous
    pub master_addr: String,

    /// Port of the rank 0 rendezvous
    pub master_port: u16,

    /// Seconds to keep retrying the rendezvous connection
    pub connect_timeout_secs: u64,

    /// Gather test predictions across workers instead of evaluating on rank 0 only
    pub distribute_eval: bool,
}

impl TrainingConfig {
    /// Create a new training configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = utils::config::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON or YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        utils::config::save_config(self, path)
    }

    /// Overlay distributed settings from `WORLD_SIZE`, `RANK`/`LOCAL_RANK`,
    /// `MASTER_ADDR` and `MASTER_PORT`
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay distributed settings from an arbitrary variable lookup
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("{} has invalid value '{}'", key, value)))
        }

        if let Some(value) = lookup("WORLD_SIZE") {
            self.distributed.world_size = parse("WORLD_SIZE", value)?;
        }
        if let Some(value) = lookup("RANK").or_else(|| lookup("LOCAL_RANK")) {
            self.distributed.rank = parse("RANK", value)?;
        }
        if let Some(value) = lookup("MASTER_ADDR") {
            self.distributed.master_addr = value;
        }
        if let Some(value) = lookup("MASTER_PORT") {
            self.distributed.master_port = parse("MASTER_PORT", value)?;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.prefix.trim().is_empty() {
            return Err(anyhow!("Run prefix must not be empty").into());
        }

        if self.training.num_epochs == 0 {
            return Err(anyhow!("Number of epochs must be greater than 0").into());
        }

        if self.data.batch_size == 0 {
            return Err(anyhow!("Batch size must be greater than 0").into());
        }

        if self.training.alpha < 0.0 || !self.training.alpha.is_finite() {
            return Err(anyhow!("Smoothing alpha must be a nonnegative real number").into());
        }

        if self.training.patience == Some(0) {
            return Err(anyhow!("Patience must be greater than 0 when set").into());
        }

        if self.optimizer.learning_rate <= 0.0 {
            return Err(anyhow!("Learning rate must be positive").into());
        }

        if self.optimizer.weight_decay < 0.0 {
            return Err(anyhow!("Weight decay must be non-negative").into());
        }

        if let OptimizerType::Sgd { momentum } = self.optimizer.optimizer_type {
            if !(0.0..1.0).contains(&momentum) {
                return Err(anyhow!("SGD momentum must be in [0.0, 1.0)").into());
            }
        }

        match &self.scheduler.scheduler_type {
            SchedulerType::OneCycle {
                max_lr,
                pct_start,
                div_factor,
                final_div_factor,
            } => {
                if *max_lr <= 0.0 {
                    return Err(anyhow!("OneCycle max_lr must be positive").into());
                }
                if !(*pct_start > 0.0 && *pct_start < 1.0) {
                    return Err(anyhow!("OneCycle pct_start must be in (0.0, 1.0)").into());
                }
                if *div_factor <= 0.0 || *final_div_factor <= 0.0 {
                    return Err(anyhow!("OneCycle division factors must be positive").into());
                }
            }
            SchedulerType::Cosine { min_lr } => {
                if *min_lr < 0.0 || *min_lr > self.optimizer.learning_rate {
                    return Err(anyhow!("Cosine min_lr must be in [0, learning_rate]").into());
                }
            }
            SchedulerType::Constant => {}
        }

        let restarts = &self.scheduler.restart_epochs;
        if restarts.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(anyhow!("Restart epochs must be strictly increasing").into());
        }
        if restarts
            .iter()
            .any(|&epoch| epoch == 0 || epoch > self.training.num_epochs)
        {
            return Err(anyhow!(
                "Restart epochs must lie in [1, {}]",
                self.training.num_epochs
            )
            .into());
        }

        if self.model.num_classes < 2 {
            return Err(anyhow!("Classifier needs at least 2 classes").into());
        }

        if self.distributed.world_size == 0 {
            return Err(anyhow!("World size must be at least 1").into());
        }
        if self.distributed.rank >= self.distributed.world_size {
            return Err(anyhow!(
                "Rank {} is out of range for world size {}",
                self.distributed.rank,
                self.distributed.world_size
            )
            .into());
        }

        Ok(())
    }

    /// Base path for prediction and per-split metrics files
    pub fn predict_base(&self) -> PathBuf {
        self.output.predict_dir.join(&self.prefix)
    }

    /// Run name without any `-suffix`, used to group summary CSVs across runs
    pub fn run_group(&self) -> &str {
        self.prefix.split('-').next().unwrap_or(&self.prefix)
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            prefix: "classifier".to_string(),
            data: DataConfig::default(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            training: TrainingParams::default(),
            checkpointing: CheckpointingConfig::default(),
            output: OutputConfig::default(),
            distributed: DistributedConfig::default(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            batch_size: 32,
            shuffle: true,
            input_key: "inputs".to_string(),
            target_key: "targets".to_string(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: vec![64, 64],
            num_classes: 2,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::AdamW,
            learning_rate: 1e-3,
            weight_decay: 0.01,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: SchedulerType::OneCycle {
                max_lr: 5e-3,
                pct_start: 0.2,
                div_factor: 25.0,
                final_div_factor: 100.0,
            },
            restart_epochs: Vec::new(),
            lr_minibatch: true,
        }
    }
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            seed: 42,
            patience: Some(10),
            alpha: 50.0,
            log_every: 10,
            save_every: 0,
            metric_to_report: "loss".to_string(),
        }
    }
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("model"),
            save: true,
            load: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            predict_dir: PathBuf::from("predict"),
            log_dir: PathBuf::from("log"),
            save_predictions: true,
            summarize_csv: SummarizeCsv::All,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            master_addr: "127.0.0.1".to_string(),
            master_port: 29500,
            connect_timeout_secs: 60,
            distribute_eval: false,
        }
    }
}
