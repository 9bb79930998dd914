//! Epoch loop behaviour: best slots, patience, pruning, smoothing and restarts

use super::fixtures::*;
use crate::training::checkpoints::{CheckpointSlot, LOSS_KEY};
use crate::training::config::SchedulerType;
use crate::training::data::Split;
use crate::training::trainer::{TrainingEvent, TrainingOutcome};
use crate::training::trial::Trial;
use approx::assert_relative_eq;

fn new_best_epochs(events: &[TrainingEvent], wanted: CheckpointSlot) -> Vec<usize> {
    events
        .iter()
        .filter_map(|event| match event {
            TrainingEvent::NewBest { slot, epoch, .. } if *slot == wanted => Some(*epoch),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_trainer_creation() {
    let fixture = TrainingTestFixture::new(3);
    let trainer = fixture.trainer();

    assert_eq!(trainer.state().epoch, 1);
    assert_eq!(trainer.state().minibatch, 0);
    assert!(trainer.state().best_loss.is_none());
    assert_eq!(trainer.optimizer().name(), "sgd");
    assert_relative_eq!(trainer.optimizer().learning_rate(), 0.1);
    assert!(trainer.log_context().is_primary());
}

#[test]
fn test_builder_requires_train_and_valid_loaders() {
    let fixture = TrainingTestFixture::new(1);
    let result = crate::training::trainer::Trainer::builder(fixture.config.clone())
        .model(Box::new(LinearProbe::new()))
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_full_run_completes() {
    let fixture = TrainingTestFixture::new(3);
    let mut trainer = fixture.trainer();

    let outcome = trainer.train(None).await.unwrap();
    assert!(matches!(outcome, TrainingOutcome::Completed(_)));
    assert_eq!(outcome.summary().final_epoch, 3);
    assert_eq!(trainer.state().epoch, 4);
    assert_eq!(trainer.state().global_step, 3 * TRAIN_SAMPLES / BATCH_SIZE);
    assert_eq!(trainer.state().history.len(), 3);

    // Separable data: the probe learns something
    let last = trainer.state().history.last().unwrap();
    let first = trainer.state().history.first().unwrap();
    let loss = |m: &Option<crate::training::metrics::Metrics>| m.as_ref().unwrap()[LOSS_KEY];
    assert!(loss(&last.train) < loss(&first.train));

    for slot in CheckpointSlot::ALL {
        assert!(trainer.store().exists(slot), "{} slot missing", slot);
    }
}

#[tokio::test]
async fn test_best_loss_updates_only_on_strict_improvement() {
    let fixture = TrainingTestFixture::new(5);
    let (mut trainer, mut rx) =
        fixture.scripted_trainer(&[(0.9, 0.5), (0.5, 0.5), (0.7, 0.5), (0.5, 0.5), (0.4, 0.5)]);

    let outcome = trainer.train(None).await.unwrap();
    let events = drain_events(&mut rx);

    assert_eq!(new_best_epochs(&events, CheckpointSlot::BestLoss), vec![1, 2, 5]);
    assert_eq!(outcome.summary().best_loss.as_ref().unwrap().epoch, 5);
    // Accuracy never moves after the first epoch
    assert_eq!(new_best_epochs(&events, CheckpointSlot::BestAccuracy), vec![1]);
}

#[tokio::test]
async fn test_best_slots_track_independently() {
    let fixture = TrainingTestFixture::new(5);
    let (mut trainer, _rx) =
        fixture.scripted_trainer(&[(0.9, 0.1), (0.5, 0.2), (0.6, 0.3), (0.7, 0.3), (0.8, 0.9)]);

    let outcome = trainer.train(None).await.unwrap();
    let summary = outcome.summary();
    assert_eq!(summary.best_loss.as_ref().unwrap().epoch, 2);
    assert_eq!(summary.best_accuracy.as_ref().unwrap().epoch, 5);

    let store = trainer.store();
    let best_loss = store.load(CheckpointSlot::BestLoss).unwrap();
    let best_accuracy = store.load(CheckpointSlot::BestAccuracy).unwrap();
    let last_minibatch = TRAIN_SAMPLES / BATCH_SIZE - 1;
    assert_eq!(best_loss.position(), (2, last_minibatch));
    assert_eq!(best_accuracy.position(), (5, last_minibatch));
    assert_relative_eq!(best_loss.training_state.best_loss.unwrap().metrics[LOSS_KEY], 0.5);
}

#[tokio::test]
async fn test_patience_stops_after_k_plus_patience() {
    let mut fixture = TrainingTestFixture::new(10);
    fixture.config.training.patience = Some(3);
    let (mut trainer, mut rx) = fixture.scripted_trainer(&[
        (0.9, 0.5),
        (0.8, 0.5),
        (0.5, 0.5),
        (0.6, 0.5),
        (0.5, 0.5),
        (0.7, 0.5),
        (0.1, 0.5),
    ]);

    let outcome = trainer.train(None).await.unwrap();
    assert!(matches!(outcome, TrainingOutcome::EarlyStopped(_)));
    assert_eq!(outcome.summary().final_epoch, 6);
    assert_eq!(outcome.summary().best_loss.as_ref().unwrap().epoch, 3);
    assert_eq!(trainer.state().epochs_without_improvement, 3);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        TrainingEvent::EarlyStopped {
            epoch: 6,
            best_epoch: Some(3)
        }
    )));
}

#[tokio::test]
async fn test_pruned_trial_ends_run() {
    let fixture = TrainingTestFixture::new(10);
    let (mut trainer, _rx) = fixture.scripted_trainer(&[(1.7, 0.5), (0.6, 0.6), (0.5, 0.7)]);
    let mut trial = RecordingTrial {
        prune_after: Some(2),
        ..RecordingTrial::default()
    };

    let outcome = trainer.train(Some(&mut trial as &mut dyn Trial)).await.unwrap();
    assert!(outcome.is_pruned());
    assert_eq!(outcome.summary().final_epoch, 2);

    // Reported values are capped at 1 and indexed from 0
    assert_eq!(trial.reports, vec![(1.0, 0), (0.6, 1)]);
    assert_eq!(trial.attrs["best_epoch"], serde_json::json!(2));
    assert!(trial.attrs.contains_key("best_metrics"));
}

#[tokio::test]
async fn test_zero_alpha_keeps_latest_minibatch_metrics() {
    let mut fixture = TrainingTestFixture::new(1);
    fixture.config.training.alpha = 0.0;
    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);

    trainer.train(None).await.unwrap();
    let last_loss = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TrainingEvent::MinibatchCompleted { loss, .. } => Some(loss),
            _ => None,
        })
        .last()
        .unwrap();
    assert_relative_eq!(trainer.state().minibatch_metrics[LOSS_KEY], last_loss);
}

#[tokio::test]
async fn test_smoothed_metrics_differ_from_raw_with_alpha() {
    let mut fixture = TrainingTestFixture::new(1);
    fixture.config.training.alpha = 50.0;
    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);

    trainer.train(None).await.unwrap();
    let losses: Vec<f64> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TrainingEvent::MinibatchCompleted { loss, .. } => Some(loss),
            _ => None,
        })
        .collect();

    let weight = 50.0 / 51.0;
    let expected = losses[1..]
        .iter()
        .fold(losses[0], |avg, &x| weight * avg + (1.0 - weight) * x);
    assert_relative_eq!(trainer.state().minibatch_metrics[LOSS_KEY], expected, epsilon = 1e-9);
}

#[tokio::test]
async fn test_warm_restarts_follow_boundaries() {
    let mut fixture = TrainingTestFixture::new(6);
    fixture.config.scheduler.scheduler_type = SchedulerType::Cosine { min_lr: 0.0 };
    fixture.config.scheduler.restart_epochs = vec![3, 5];
    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);

    trainer.train(None).await.unwrap();
    let restarts: Vec<(usize, usize)> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TrainingEvent::WarmRestart { epoch, cycle_steps } => Some((epoch, cycle_steps)),
            _ => None,
        })
        .collect();
    assert_eq!(restarts, vec![(3, 2), (5, 2)]);

    // Epochs 3 and 5 start their cycle at the base rate
    let history = &trainer.state().history;
    assert_relative_eq!(history[0].learning_rate, history[2].learning_rate, epsilon = 1e-12);
    assert_relative_eq!(history[2].learning_rate, history[4].learning_rate, epsilon = 1e-12);
}

#[tokio::test]
async fn test_per_minibatch_schedule_counts_minibatches() {
    let mut fixture = TrainingTestFixture::new(2);
    fixture.config.scheduler.scheduler_type = SchedulerType::Cosine { min_lr: 0.0 };
    fixture.config.scheduler.lr_minibatch = true;
    let mut trainer = fixture.trainer();

    assert_eq!(trainer.schedule().state().cycle_steps, 2 * TRAIN_SAMPLES / BATCH_SIZE);
    trainer.train(None).await.unwrap();
    assert_eq!(trainer.schedule().state().step, 2 * TRAIN_SAMPLES / BATCH_SIZE);
}

#[tokio::test]
async fn test_evaluate_reuses_identical_positions() {
    let fixture = TrainingTestFixture::new(2);
    // Loss and accuracy both improve last at epoch 2, so all slots share weights
    let (mut trainer, _rx) = fixture.scripted_trainer(&[(0.9, 0.1), (0.5, 0.9)]);
    trainer.train(None).await.unwrap();

    let report = trainer.evaluate(&[Split::Test], true, true).await.unwrap();
    assert_eq!(report.entries.len(), 3);
    let final_metrics = report.get(CheckpointSlot::Latest, Split::Test).unwrap();
    assert_eq!(report.get(CheckpointSlot::BestLoss, Split::Test), Some(final_metrics));
    assert_eq!(report.get(CheckpointSlot::BestAccuracy, Split::Test), Some(final_metrics));
    assert!(report.entries.iter().all(|e| e.epoch == 2));
}

#[tokio::test]
async fn test_evaluate_writes_summaries_and_predictions() {
    let mut fixture = TrainingTestFixture::new(2);
    fixture.config.output.summarize_csv = crate::training::config::SummarizeCsv::All;
    fixture.config.output.save_predictions = true;
    let (mut trainer, _rx) = fixture.scripted_trainer(&[(0.5, 0.9), (0.9, 0.1)]);
    trainer.train(None).await.unwrap();

    let report = trainer.evaluate(&[Split::Valid, Split::Test], true, true).await.unwrap();
    assert_eq!(report.entries.len(), 6);

    let predict_dir = fixture.temp_dir.path().join("predict");
    let log_dir = fixture.temp_dir.path().join("log");
    assert!(predict_dir.join("fixture.final.test.safetensors").exists());
    assert!(predict_dir.join("fixture.best.test.safetensors").exists());
    assert!(predict_dir.join("fixture.metrics.train.csv").exists());
    assert!(predict_dir.join("fixture.metrics.valid.csv").exists());
    assert!(log_dir.join("fixture.Final.metrics.csv").exists());
    assert!(log_dir.join("fixture.Best.metrics.csv").exists());

    let best_acc = std::fs::read_to_string(log_dir.join("fixture.best.accuracy.csv")).unwrap();
    assert!(best_acc.lines().nth(1).unwrap().starts_with("1,"));
}

#[tokio::test]
async fn test_no_save_skips_checkpoints_and_evaluation() {
    let mut fixture = TrainingTestFixture::new(1);
    fixture.config.checkpointing.save = false;
    let mut trainer = fixture.trainer();

    trainer.train(None).await.unwrap();
    assert!(!trainer.store().exists(CheckpointSlot::Latest));
    let report = trainer.evaluate(&[Split::Test], true, true).await.unwrap();
    assert!(report.entries.is_empty());
}
