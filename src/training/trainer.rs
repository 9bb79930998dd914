//! Resumable training loop
//!
//! [`Trainer`] drives the epoch loop over injected collaborators: the model,
//! loss, metric function and per-split loaders. It owns the optimizer, the
//! learning rate [`ScheduleController`], the checkpoint slots and the
//! [`TrainingState`] needed to resume at the exact minibatch a run stopped at.
//! Every worker of a distributed run executes the same loop; the primary
//! worker alone writes files and takes loop decisions, which are broadcast.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::training::checkpoints::{CheckpointRecord, CheckpointSlot, CheckpointStore, ModelState};
use crate::training::config::TrainingConfig;
use crate::training::context::LogContext;
use crate::training::data::{BatchLoader, Split};
use crate::training::distributed::{DistributedContext, SingleProcess};
use crate::training::loss::{CrossEntropyLoss, Loss};
use crate::training::metrics::{save_predictions, ClassifierMetrics, Metrics, MetricsAggregator, MetricsCsv, MetricsFn};
use crate::training::model::{predictions, Model};
use crate::training::optimizers::{create_optimizer, sorted_vars, Optimizer, ScheduleController};
use crate::training::trial::Trial;
use crate::utils::timing::{BatchTiming, Timer};

/// Epoch and validation metrics of a best checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestRecord {
    /// Epoch the metrics were measured after
    pub epoch: usize,
    /// Validation metrics at that epoch
    pub metrics: Metrics,
}

/// Metrics of one finished epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train: Option<Metrics>,
    pub valid: Option<Metrics>,
    /// Learning rate at the start of the epoch
    pub learning_rate: f64,
}

/// Training state tracking
///
/// `(epoch, minibatch)` names the last minibatch that finished; `epoch`
/// starts at 1. A `None` best record compares as the worst possible value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: usize,

    /// Last finished minibatch within the epoch
    pub minibatch: usize,

    /// Optimizer steps taken over the whole run
    pub global_step: usize,

    /// Smoothed metrics of the current epoch
    pub minibatch_metrics: Metrics,

    /// Lowest validation loss so far
    pub best_loss: Option<BestRecord>,

    /// Highest validation accuracy so far
    pub best_accuracy: Option<BestRecord>,

    /// Finished epochs since the validation loss last improved
    pub epochs_without_improvement: usize,

    /// Per-epoch metrics
    pub history: Vec<EpochSummary>,
}

impl TrainingState {
    pub fn new() -> Self {
        Self {
            epoch: 1,
            minibatch: 0,
            global_step: 0,
            minibatch_metrics: Metrics::new(),
            best_loss: None,
            best_accuracy: None,
            epochs_without_improvement: 0,
            history: Vec::new(),
        }
    }

    /// Position to continue from after restoring this state
    ///
    /// The stored minibatch already finished, so training picks up at the
    /// next one, or at the start of the next epoch when it was the last.
    pub fn resume_position(&self, batches_per_epoch: usize) -> (usize, usize) {
        if self.minibatch + 1 < batches_per_epoch {
            (self.epoch, self.minibatch + 1)
        } else {
            (self.epoch + 1, 0)
        }
    }

    /// Best record tracked for `slot`
    pub fn best(&self, slot: CheckpointSlot) -> Option<&BestRecord> {
        match slot {
            CheckpointSlot::Latest => None,
            CheckpointSlot::BestLoss => self.best_loss.as_ref(),
            CheckpointSlot::BestAccuracy => self.best_accuracy.as_ref(),
        }
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Best records at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Last epoch that ran to completion
    pub final_epoch: usize,
    pub best_loss: Option<BestRecord>,
    pub best_accuracy: Option<BestRecord>,
}

/// How a call to [`Trainer::train`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    /// All configured epochs ran
    Completed(TrainingSummary),
    /// Validation loss stopped improving for `patience` epochs
    EarlyStopped(TrainingSummary),
    /// The hyper-parameter search pruned the trial
    Pruned(TrainingSummary),
}

impl TrainingOutcome {
    pub fn summary(&self) -> &TrainingSummary {
        match self {
            Self::Completed(s) | Self::EarlyStopped(s) | Self::Pruned(s) => s,
        }
    }

    pub fn is_pruned(&self) -> bool {
        matches!(self, Self::Pruned(_))
    }
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize, start_minibatch: usize },
    MinibatchCompleted { epoch: usize, minibatch: usize, loss: f64, lr: f64 },
    WarmRestart { epoch: usize, cycle_steps: usize },
    EpochCompleted { epoch: usize, train: Option<Metrics>, valid: Option<Metrics> },
    CheckpointSaved { slot: CheckpointSlot, path: PathBuf },
    NewBest { slot: CheckpointSlot, epoch: usize, metrics: Metrics },
    EarlyStopped { epoch: usize, best_epoch: Option<usize> },
    Pruned { epoch: usize },
    TrainingCompleted { final_epoch: usize },
}

/// Concatenated model outputs over a split
#[derive(Debug, Clone)]
pub struct Prediction {
    pub predict: Tensor,
    /// `None` when the split carries no targets
    pub targets: Option<Tensor>,
}

/// Metrics of one checkpoint slot on one split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEvaluation {
    pub slot: CheckpointSlot,
    pub split: Split,
    pub epoch: usize,
    /// `None` on non-primary workers and for splits without targets
    pub metrics: Option<Metrics>,
}

/// Result of [`Trainer::evaluate`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub entries: Vec<SlotEvaluation>,
}

impl EvaluationReport {
    /// Metrics of `slot` on `split`
    pub fn get(&self, slot: CheckpointSlot, split: Split) -> Option<&Metrics> {
        self.entries
            .iter()
            .find(|e| e.slot == slot && e.split == split)
            .and_then(|e| e.metrics.as_ref())
    }
}

/// Assembles a [`Trainer`] from its collaborators
pub struct TrainerBuilder {
    config: TrainingConfig,
    model: Option<Box<dyn Model>>,
    loss: Option<Box<dyn Loss>>,
    metrics_fn: Option<Box<dyn MetricsFn>>,
    loaders: BTreeMap<Split, Box<dyn BatchLoader>>,
    eval_loaders: BTreeMap<Split, Box<dyn BatchLoader>>,
    optimizer: Option<Box<dyn Optimizer>>,
    schedule: Option<ScheduleController>,
    ctx: Option<Arc<dyn DistributedContext>>,
    device: Device,
    events: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl TrainerBuilder {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            model: None,
            loss: None,
            metrics_fn: None,
            loaders: BTreeMap::new(),
            eval_loaders: BTreeMap::new(),
            optimizer: None,
            schedule: None,
            ctx: None,
            device: Device::Cpu,
            events: None,
        }
    }

    pub fn model(mut self, model: Box<dyn Model>) -> Self {
        self.model = Some(model);
        self
    }

    /// Defaults to plain cross-entropy
    pub fn loss(mut self, loss: Box<dyn Loss>) -> Self {
        self.loss = Some(loss);
        self
    }

    /// Defaults to [`ClassifierMetrics`]
    pub fn metrics(mut self, metrics_fn: Box<dyn MetricsFn>) -> Self {
        self.metrics_fn = Some(metrics_fn);
        self
    }

    /// Loader over this worker's shard of `split`
    pub fn loader(mut self, split: Split, loader: Box<dyn BatchLoader>) -> Self {
        self.loaders.insert(split, loader);
        self
    }

    /// Unsharded loader used by non-distributed prediction on the primary worker
    pub fn eval_loader(mut self, split: Split, loader: Box<dyn BatchLoader>) -> Self {
        self.eval_loaders.insert(split, loader);
        self
    }

    /// Defaults to the optimizer described by the configuration
    pub fn optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Defaults to the schedule described by the configuration
    pub fn schedule(mut self, schedule: ScheduleController) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Defaults to a single process
    pub fn context(mut self, ctx: Arc<dyn DistributedContext>) -> Self {
        self.ctx = Some(ctx);
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn events(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn build(mut self) -> Result<Trainer> {
        self.config.validate()?;

        let model = self.model.ok_or_else(|| Error::config("trainer needs a model"))?;
        for split in [Split::Train, Split::Valid] {
            if !self.loaders.contains_key(&split) {
                return Err(Error::config(format!("trainer needs a {} loader", split)));
            }
        }
        let steps_per_epoch = self.loaders[&Split::Train].num_batches();
        if steps_per_epoch == 0 {
            return Err(Error::data("training split has no minibatches"));
        }

        let ctx = self.ctx.unwrap_or_else(|| Arc::new(SingleProcess));
        let log = LogContext::new(self.config.prefix.clone(), ctx.rank(), ctx.is_primary());

        let mut optimizer = match self.optimizer {
            Some(optimizer) => optimizer,
            None => create_optimizer(&self.config.optimizer, model.var_map())?,
        };
        let schedule = match self.schedule {
            Some(schedule) => schedule,
            None => ScheduleController::new(
                &self.config.scheduler,
                self.config.optimizer.learning_rate,
                self.config.training.num_epochs,
                steps_per_epoch,
            ),
        };
        optimizer.set_learning_rate(schedule.lr());

        let aggregator = MetricsAggregator::new(self.config.training.alpha)?;

        info!(
            parent: log.span(),
            optimizer = optimizer.name(),
            parameters = optimizer.parameter_count(),
            steps_per_epoch,
            world_size = ctx.world_size(),
            "Trainer ready on {:?}",
            self.device
        );

        Ok(Trainer {
            store: CheckpointStore::from_config(&self.config),
            csv: MetricsCsv::from_config(&self.config),
            config: self.config,
            model,
            loss: self.loss.unwrap_or_else(|| Box::new(CrossEntropyLoss::new())),
            metrics_fn: self.metrics_fn.unwrap_or_else(|| Box::new(ClassifierMetrics::new())),
            loaders: self.loaders,
            eval_loaders: self.eval_loaders,
            optimizer,
            schedule,
            ctx,
            log,
            aggregator,
            state: TrainingState::new(),
            resumed: false,
            device: self.device,
            events: self.events,
        })
    }
}

/// Main trainer
pub struct Trainer {
    config: TrainingConfig,
    model: Box<dyn Model>,
    loss: Box<dyn Loss>,
    metrics_fn: Box<dyn MetricsFn>,
    loaders: BTreeMap<Split, Box<dyn BatchLoader>>,
    eval_loaders: BTreeMap<Split, Box<dyn BatchLoader>>,
    optimizer: Box<dyn Optimizer>,
    schedule: ScheduleController,
    store: CheckpointStore,
    csv: MetricsCsv,
    ctx: Arc<dyn DistributedContext>,
    log: LogContext,
    aggregator: MetricsAggregator,
    state: TrainingState,
    resumed: bool,
    device: Device,
    events: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl Trainer {
    pub fn builder(config: TrainingConfig) -> TrainerBuilder {
        TrainerBuilder::new(config)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn schedule(&self) -> &ScheduleController {
        &self.schedule
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn log_context(&self) -> &LogContext {
        &self.log
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn emit(&self, event: TrainingEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn summary(&self, final_epoch: usize) -> TrainingSummary {
        TrainingSummary {
            final_epoch,
            best_loss: self.state.best_loss.clone(),
            best_accuracy: self.state.best_accuracy.clone(),
        }
    }

    fn batches_per_epoch(&self) -> usize {
        self.loaders
            .get(&Split::Train)
            .map_or(0, |loader| loader.num_batches())
    }

    fn snapshot(&self) -> Result<CheckpointRecord> {
        Ok(CheckpointRecord {
            config: self.config.clone(),
            model_state: ModelState::from_var_map(self.model.var_map())?,
            optimizer_state: self.optimizer.state_dict()?,
            schedule_state: self.schedule.state_dict(),
            training_state: self.state.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Write `slot` from the primary worker, then wait for every worker
    async fn save_checkpoint(&self, slot: CheckpointSlot) -> Result<()> {
        if !self.config.checkpointing.save {
            return Ok(());
        }
        if self.ctx.is_primary() {
            let record = self.snapshot()?;
            let path = self.store.save(slot, &record)?;
            self.emit(TrainingEvent::CheckpointSaved { slot, path });
        }
        self.ctx.synchronize().await
    }

    /// Copy the primary worker's parameters to every worker
    async fn broadcast_parameters(&self) -> Result<()> {
        if self.ctx.world_size() == 1 {
            return Ok(());
        }
        for (_, var) in sorted_vars(self.model.var_map())? {
            let gathered = self.ctx.all_gather(&var.as_tensor().detach().unsqueeze(0)?).await?;
            var.set(&gathered.get(0)?)?;
        }
        debug!(parent: self.log.span(), "Parameters synchronized from the primary worker");
        Ok(())
    }

    /// Replace each gradient by its mean over all workers
    async fn average_gradients(&self, grads: &mut GradStore) -> Result<()> {
        if self.ctx.world_size() == 1 {
            return Ok(());
        }
        for (_, var) in sorted_vars(self.model.var_map())? {
            let grad = match grads.get(var.as_tensor()) {
                Some(grad) => grad.clone(),
                None => var.as_tensor().zeros_like()?,
            };
            let gathered = self.ctx.all_gather(&grad.unsqueeze(0)?).await?;
            grads.insert(var.as_tensor(), gathered.mean(0)?);
        }
        Ok(())
    }

    /// Resume from the `latest` slot
    ///
    /// Returns `false` when loading is disabled or no checkpoint exists yet; a
    /// checkpoint that exists but cannot be decoded is an error.
    pub async fn load_checkpoint(&mut self) -> Result<bool> {
        if !self.config.checkpointing.load {
            info!(parent: self.log.span(), "Checkpoint loading disabled, starting fresh");
            return Ok(false);
        }

        self.ctx.synchronize().await?;
        let record = match self.store.load(CheckpointSlot::Latest) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                warn!(
                    parent: self.log.span(),
                    "No checkpoint at {}, starting fresh",
                    self.store.path(CheckpointSlot::Latest).display()
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        record.model_state.apply_to(self.model.var_map())?;
        self.optimizer.load_state_dict(record.optimizer_state)?;
        self.schedule.load_state_dict(record.schedule_state)?;
        self.optimizer.set_learning_rate(self.schedule.lr());

        let saved = (record.training_state.epoch, record.training_state.minibatch);
        self.state = record.training_state;
        let (epoch, minibatch) = self.state.resume_position(self.batches_per_epoch());
        self.state.epoch = epoch;
        self.state.minibatch = minibatch;
        self.aggregator.restore(self.state.minibatch_metrics.clone());
        self.loss.update_epoch(epoch - 1);
        self.resumed = true;

        info!(
            parent: self.log.span(),
            epoch,
            minibatch,
            best_loss_epoch = self.state.best_loss.as_ref().map(|b| b.epoch),
            best_accuracy_epoch = self.state.best_accuracy.as_ref().map(|b| b.epoch),
            "Loaded checkpoint at epoch {} minibatch {}, resuming at epoch {} minibatch {}",
            saved.0,
            saved.1,
            epoch,
            minibatch
        );
        Ok(true)
    }

    /// Run the epoch loop until all epochs finished, patience ran out or the
    /// trial was pruned
    pub async fn train(&mut self, mut trial: Option<&mut dyn Trial>) -> Result<TrainingOutcome> {
        let num_epochs = self.config.training.num_epochs;
        let primary = self.ctx.is_primary();

        if !self.resumed && primary {
            self.csv.reset_epoch_files()?;
        }
        self.broadcast_parameters().await?;

        let mut start_minibatch = self.state.minibatch;
        let mut final_epoch = self.state.epoch.saturating_sub(1);

        // A restored run may already have run out of patience
        let stopped = self
            .config
            .training
            .patience
            .is_some_and(|patience| self.state.epochs_without_improvement >= patience);
        if self.ctx.broadcast_flag(stopped).await? {
            info!(
                parent: self.log.span(),
                final_epoch,
                "Run already stopped early after epoch {}, nothing to train",
                final_epoch
            );
            return Ok(TrainingOutcome::EarlyStopped(self.summary(final_epoch)));
        }

        while self.state.epoch <= num_epochs {
            let epoch = self.state.epoch;
            let epoch_timer = Timer::new(format!("epoch {}", epoch));

            if start_minibatch == 0 {
                if let Some(state) = self.schedule.warm_restart(epoch) {
                    self.optimizer.set_learning_rate(self.schedule.lr());
                    self.emit(TrainingEvent::WarmRestart {
                        epoch,
                        cycle_steps: state.cycle_steps,
                    });
                }
            }

            let epoch_lr = self.optimizer.learning_rate();
            self.emit(TrainingEvent::EpochStarted { epoch, start_minibatch });
            let train_prediction = self.train_epoch(start_minibatch).await?;
            start_minibatch = 0;

            if !self.schedule.per_minibatch() {
                let lr = self.schedule.step();
                self.optimizer.set_learning_rate(lr);
            }
            self.state.minibatch = self.batches_per_epoch().saturating_sub(1);
            self.save_checkpoint(CheckpointSlot::Latest).await?;

            let train_metrics = match &train_prediction {
                Some(prediction) => self.log_predict(Split::Train, None, Some(epoch), prediction)?,
                None => None,
            };
            let valid_prediction = self.predict(Split::Valid, true).await?;
            let valid_metrics = match &valid_prediction {
                Some(prediction) => self.log_predict(Split::Valid, None, Some(epoch), prediction)?,
                None => None,
            };

            let loss_improved = self.update_best(CheckpointSlot::BestLoss, epoch, valid_metrics.as_ref());
            let loss_improved = self.ctx.broadcast_flag(loss_improved).await?;
            let accuracy_improved = self.update_best(CheckpointSlot::BestAccuracy, epoch, valid_metrics.as_ref());
            let accuracy_improved = self.ctx.broadcast_flag(accuracy_improved).await?;

            if loss_improved {
                self.state.epochs_without_improvement = 0;
                self.save_checkpoint(CheckpointSlot::BestLoss).await?;
            } else {
                self.state.epochs_without_improvement += 1;
                if let Some(best) = &self.state.best_loss {
                    info!(
                        parent: self.log.span(),
                        epoch,
                        best_epoch = best.epoch,
                        epochs_without_improvement = self.state.epochs_without_improvement,
                        "No validation loss improvement since epoch {}",
                        best.epoch
                    );
                }
            }
            if accuracy_improved {
                self.save_checkpoint(CheckpointSlot::BestAccuracy).await?;
            }

            self.state.history.push(EpochSummary {
                epoch,
                train: train_metrics.clone(),
                valid: valid_metrics.clone(),
                learning_rate: epoch_lr,
            });
            self.loss.update_epoch(epoch);
            self.save_checkpoint(CheckpointSlot::Latest).await?;

            self.log.progress(&format!("Total epoch time:      {:.3}s", epoch_timer.stop().as_secs_f64()));
            self.emit(TrainingEvent::EpochCompleted {
                epoch,
                train: train_metrics,
                valid: valid_metrics.clone(),
            });

            final_epoch = epoch;
            self.state.epoch += 1;
            self.state.minibatch = 0;

            let mut prune = false;
            if let (Some(trial), Some(metrics)) = (trial.as_deref_mut(), valid_metrics.as_ref()) {
                prune = self.report_trial(trial, epoch, metrics);
            }
            if self.ctx.broadcast_flag(prune).await? {
                info!(parent: self.log.span(), epoch, "Trial pruned at epoch {}", epoch);
                self.emit(TrainingEvent::Pruned { epoch });
                return Ok(TrainingOutcome::Pruned(self.summary(final_epoch)));
            }

            let out_of_patience = self
                .config
                .training
                .patience
                .is_some_and(|patience| self.state.epochs_without_improvement >= patience);
            if self.ctx.broadcast_flag(out_of_patience).await? {
                let best_epoch = self.state.best_loss.as_ref().map(|b| b.epoch);
                info!(
                    parent: self.log.span(),
                    epoch,
                    best_epoch,
                    "Early stopping at epoch {}: no validation loss improvement for {} epochs",
                    epoch,
                    self.state.epochs_without_improvement
                );
                self.emit(TrainingEvent::EarlyStopped { epoch, best_epoch });
                return Ok(TrainingOutcome::EarlyStopped(self.summary(final_epoch)));
            }
        }

        info!(parent: self.log.span(), final_epoch, "Training completed");
        self.emit(TrainingEvent::TrainingCompleted { final_epoch });
        Ok(TrainingOutcome::Completed(self.summary(final_epoch)))
    }

    /// Record `metrics` as the new best of `slot` if they strictly improve it
    fn update_best(&mut self, slot: CheckpointSlot, epoch: usize, metrics: Option<&Metrics>) -> bool {
        let Some(metrics) = metrics else {
            return false;
        };
        if !slot.improves(metrics, self.state.best(slot)) {
            return false;
        }

        let record = BestRecord {
            epoch,
            metrics: metrics.clone(),
        };
        info!(
            parent: self.log.span(),
            epoch,
            %slot,
            previous_epoch = self.state.best(slot).map(|b| b.epoch),
            "New {} record at epoch {}:{}",
            slot,
            epoch,
            crate::training::metrics::format_metrics(metrics)
        );
        match slot {
            CheckpointSlot::BestLoss => self.state.best_loss = Some(record),
            CheckpointSlot::BestAccuracy => self.state.best_accuracy = Some(record),
            CheckpointSlot::Latest => return false,
        }
        self.emit(TrainingEvent::NewBest {
            slot,
            epoch,
            metrics: metrics.clone(),
        });
        true
    }

    /// Report the monitored metric to a trial; returns whether to prune
    fn report_trial(&self, trial: &mut dyn Trial, epoch: usize, metrics: &Metrics) -> bool {
        let key = &self.config.training.metric_to_report;
        match metrics.get(key) {
            Some(&value) => trial.report(value.min(1.0), epoch - 1),
            None => warn!(parent: self.log.span(), "Metric '{}' not produced, nothing reported to trial", key),
        }
        if let Some(best) = &self.state.best_loss {
            trial.set_user_attr("best_epoch", serde_json::json!(best.epoch));
            trial.set_user_attr("best_metrics", serde_json::json!(best.metrics));
        }
        trial.should_prune()
    }

    /// Train over one epoch starting at `start_minibatch`
    ///
    /// Skipped minibatches are never loaded. Returns the gathered predictions
    /// and targets of the whole epoch on the primary worker and `None`
    /// elsewhere.
    pub async fn train_epoch(&mut self, start_minibatch: usize) -> Result<Option<Prediction>> {
        let epoch = self.state.epoch;
        let primary = self.ctx.is_primary();
        let target_key = self.config.data.target_key.clone();
        let log_every = self.config.training.log_every;
        let save_every = self.config.training.save_every;

        let (num_batches, skipped) = {
            let loader = self
                .loaders
                .get_mut(&Split::Train)
                .ok_or_else(|| Error::config("no train loader"))?;
            loader.start_epoch(epoch);
            let skipped = if start_minibatch > 0 { loader.skip(start_minibatch) } else { 0 };
            (loader.num_batches(), skipped)
        };
        if start_minibatch > 0 {
            info!(
                parent: self.log.span(),
                epoch,
                skipped,
                "Skipping the first {} minibatches of epoch {}",
                skipped,
                epoch
            );
        }

        let mut all_predict = Vec::new();
        let mut all_targets = Vec::new();
        let mut minibatch = start_minibatch;

        loop {
            let batch = match self.loaders.get_mut(&Split::Train) {
                Some(loader) => loader.next_batch()?,
                None => None,
            };
            let Some(batch) = batch else {
                break;
            };

            let start = Instant::now();
            let output = self.model.forward(&batch, true)?;
            let predict = predictions(&output)?.clone();
            let targets = batch.get(&target_key)?.clone();
            let loss = self.loss.compute(&predict, &targets)?;
            let forward_done = Instant::now();

            let mut grads = loss.backward()?;
            self.average_gradients(&mut grads).await?;
            self.optimizer.step(&grads)?;
            drop(grads);
            let backward_done = Instant::now();

            self.state.global_step += 1;
            if self.schedule.per_minibatch() {
                let lr = self.schedule.step();
                self.optimizer.set_learning_rate(lr);
            }

            let loss_value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
            let predict = predict.detach();
            let raw = self.metrics_fn.minibatch_metrics(&predict, &targets, loss_value)?;
            self.state.minibatch_metrics = self.aggregator.update(minibatch, &raw).clone();
            self.state.minibatch = minibatch;

            let gathered_predict = self.ctx.all_gather(&predict).await?;
            let gathered_targets = self.ctx.all_gather(&targets).await?;
            if primary {
                all_predict.push(gathered_predict);
                all_targets.push(gathered_targets);
            }

            let timing = BatchTiming::from_marks(start, forward_done, backward_done);
            let lr = self.optimizer.learning_rate();
            if log_every > 0 && (minibatch + 1) % log_every == 0 {
                self.log.progress(&format!(
                    "E:{:3}, B:{:5}/{}, {}, lr: {:.2e}, dt: {:.2}s fwd {:.2}s bwd {:.2}s",
                    epoch,
                    minibatch + 1,
                    num_batches,
                    self.metrics_fn.format_minibatch(&self.state.minibatch_metrics),
                    lr,
                    timing.batch,
                    timing.forward,
                    timing.backward
                ));
            }
            debug!(parent: self.log.span(), epoch, minibatch, loss = loss_value, lr, "Minibatch finished");
            self.emit(TrainingEvent::MinibatchCompleted {
                epoch,
                minibatch,
                loss: loss_value,
                lr,
            });

            if save_every > 0 && (minibatch + 1) % save_every == 0 && minibatch + 1 < num_batches {
                self.save_checkpoint(CheckpointSlot::Latest).await?;
            }
            minibatch += 1;
        }

        if !primary || all_predict.is_empty() {
            return Ok(None);
        }
        Ok(Some(Prediction {
            predict: Tensor::cat(&all_predict, 0)?,
            targets: Some(Tensor::cat(&all_targets, 0)?),
        }))
    }

    /// Forward-only pass over `split`
    ///
    /// With `distributed` every worker predicts its shard and the results are
    /// gathered in rank order; otherwise the primary worker predicts the whole
    /// split alone, preserving sample order. Only the primary worker gets
    /// `Some`.
    pub async fn predict(&mut self, split: Split, distributed: bool) -> Result<Option<Prediction>> {
        let primary = self.ctx.is_primary();
        if !distributed && !primary {
            return Ok(None);
        }
        let gather = distributed && self.ctx.world_size() > 1;
        let target_key = self.config.data.target_key.clone();

        let span = self.log.span().clone();
        let loader = if !distributed && self.ctx.world_size() > 1 {
            self.eval_loaders.get_mut(&split).ok_or_else(|| {
                Error::config(format!(
                    "non-distributed prediction of the {} split needs an unsharded loader",
                    split
                ))
            })?
        } else {
            match self.eval_loaders.get_mut(&split) {
                Some(loader) if !distributed => loader,
                _ => self
                    .loaders
                    .get_mut(&split)
                    .ok_or_else(|| Error::data(format!("no loader for the {} split", split)))?,
            }
        };
        if gather {
            debug!(
                parent: &span,
                split = split.name(),
                "Distributed prediction; padded samples may repeat"
            );
        }

        loader.start_epoch(self.state.epoch);
        let mut all_predict = Vec::new();
        let mut all_targets = Vec::new();
        let mut has_targets = true;

        while let Some(batch) = loader.next_batch()? {
            let output = self.model.forward(&batch, false)?;
            let mut predict = predictions(&output)?.detach();
            let mut targets = batch.get(&target_key).ok().cloned();
            if gather {
                predict = self.ctx.all_gather(&predict).await?;
                if let Some(t) = targets {
                    targets = Some(self.ctx.all_gather(&t).await?);
                }
            }
            if primary {
                all_predict.push(predict);
                match targets {
                    Some(t) => all_targets.push(t),
                    None => has_targets = false,
                }
            }
        }

        if !primary || all_predict.is_empty() {
            return Ok(None);
        }
        let targets = if has_targets {
            Some(Tensor::cat(&all_targets, 0)?)
        } else {
            None
        };
        Ok(Some(Prediction {
            predict: Tensor::cat(&all_predict, 0)?,
            targets,
        }))
    }

    /// Compute, log and export metrics for a prediction
    ///
    /// `slot` is set for checkpoint evaluations and `epoch` during training.
    fn log_predict(
        &self,
        split: Split,
        slot: Option<CheckpointSlot>,
        epoch: Option<usize>,
        prediction: &Prediction,
    ) -> Result<Option<Metrics>> {
        let output_prefix = match slot {
            Some(slot) => format!("{}.{}.{}", self.config.predict_base().display(), slot.prediction_tag(), split),
            None => String::new(),
        };

        let metrics = match &prediction.targets {
            Some(targets) => {
                let (metrics, line) = self.metrics_fn.compute(
                    &prediction.predict,
                    targets,
                    self.loss.as_ref(),
                    &output_prefix,
                    &self.log,
                )?;
                match (epoch, slot) {
                    (Some(epoch), _) => {
                        self.log
                            .progress(&format!("Epoch {} Complete! {}{}", epoch, split.label(), line));
                        self.csv.write_epoch(split, epoch, &metrics)?;
                    }
                    (None, Some(slot)) => {
                        self.log
                            .progress(&format!("{:<7} {}{}", slot.description(), split.label(), line));
                        self.csv.write_summary(slot.description(), &metrics)?;
                    }
                    (None, None) => {}
                }
                Some(metrics)
            }
            None => {
                self.log
                    .progress(&format!("{} Metrics skipped because target is None!", split.label()));
                None
            }
        };

        if self.config.output.save_predictions && slot.is_some() {
            let path = PathBuf::from(format!("{}.safetensors", output_prefix));
            save_predictions(&path, &prediction.predict, prediction.targets.as_ref())?;
        }
        Ok(metrics)
    }

    /// Evaluate checkpoint slots over `splits`
    ///
    /// `final_` evaluates the `latest` slot, `best` the `best-loss` and
    /// `best-accuracy` slots. Slots holding the same training position reuse
    /// the metrics computed for the first of them. Missing slots are skipped.
    pub async fn evaluate(&mut self, splits: &[Split], best: bool, final_: bool) -> Result<EvaluationReport> {
        let mut report = EvaluationReport::default();
        if !self.config.checkpointing.save {
            info!(parent: self.log.span(), "No model saved! Cannot give final status.");
            return Ok(report);
        }

        self.ctx.synchronize().await?;
        let distributed = self.config.distributed.distribute_eval;
        if distributed && self.ctx.world_size() > 1 {
            warn!(
                parent: self.log.span(),
                "Using distributed evaluation; sample order in prediction files follows rank interleaving"
            );
        }

        let mut slots = Vec::new();
        if final_ {
            slots.push(CheckpointSlot::Latest);
        }
        if best {
            slots.extend([CheckpointSlot::BestLoss, CheckpointSlot::BestAccuracy]);
        }

        let mut computed: HashMap<((usize, usize), Split), Option<Metrics>> = HashMap::new();
        for slot in slots {
            let record = match self.store.load(slot) {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    warn!(parent: self.log.span(), %slot, "No {} checkpoint to evaluate", slot);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let position = record.position();
            info!(
                parent: self.log.span(),
                %slot,
                epoch = position.0,
                "Getting predictions for {} model {} (epoch {})",
                slot,
                self.store.path(slot).display(),
                position.0
            );
            record.model_state.apply_to(self.model.var_map())?;

            for &split in splits {
                if !self.loaders.contains_key(&split) && !self.eval_loaders.contains_key(&split) {
                    continue;
                }
                let metrics = match computed.get(&(position, split)) {
                    Some(metrics) => {
                        info!(
                            parent: self.log.span(),
                            %slot,
                            split = split.name(),
                            "Same weights as an earlier slot, reusing its metrics"
                        );
                        if let Some(metrics) = metrics {
                            self.log.progress(&format!(
                                "{:<7} {}{}",
                                slot.description(),
                                split.label(),
                                crate::training::metrics::format_metrics(metrics)
                            ));
                            if self.ctx.is_primary() {
                                self.csv.write_summary(slot.description(), metrics)?;
                            }
                        }
                        metrics.clone()
                    }
                    None => {
                        let metrics = match self.predict(split, distributed).await? {
                            Some(prediction) => self.log_predict(split, Some(slot), None, &prediction)?,
                            None => None,
                        };
                        computed.insert((position, split), metrics.clone());
                        metrics
                    }
                };
                report.entries.push(SlotEvaluation {
                    slot,
                    split,
                    epoch: position.0,
                    metrics,
                });
            }

            if slot == CheckpointSlot::BestAccuracy && self.ctx.is_primary() {
                if let Some(best) = &record.training_state.best_accuracy {
                    self.csv.write_best_accuracy(best.epoch, &best.metrics)?;
                }
            }
        }
        Ok(report)
    }
}
