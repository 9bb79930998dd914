//! Resuming runs from checkpoint slots

use super::fixtures::*;
use crate::error::Error;
use crate::training::checkpoints::CheckpointSlot;
use crate::training::config::SchedulerType;
use crate::training::trainer::{TrainingEvent, TrainingOutcome};
use approx::assert_relative_eq;

const BATCHES: usize = TRAIN_SAMPLES / BATCH_SIZE;

#[tokio::test]
async fn test_missing_checkpoint_starts_fresh() {
    let fixture = TrainingTestFixture::new(2);
    let mut trainer = fixture.trainer();

    assert!(!trainer.load_checkpoint().await.unwrap());
    assert_eq!((trainer.state().epoch, trainer.state().minibatch), (1, 0));
}

#[tokio::test]
async fn test_loading_disabled_ignores_checkpoint() {
    let mut fixture = TrainingTestFixture::new(1);
    fixture.trainer().train(None).await.unwrap();

    fixture.config.checkpointing.load = false;
    let mut trainer = fixture.trainer();
    assert!(!trainer.load_checkpoint().await.unwrap());
    assert_eq!(trainer.state().epoch, 1);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_fatal() {
    let fixture = TrainingTestFixture::new(1);
    let mut trainer = fixture.trainer();
    let path = trainer.store().path(CheckpointSlot::Latest);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"definitely not bincode").unwrap();

    let err = trainer.load_checkpoint().await.unwrap_err();
    assert!(matches!(err, Error::CorruptCheckpoint { .. }));
}

#[tokio::test]
async fn test_finished_epoch_resumes_at_next_epoch() {
    let mut fixture = TrainingTestFixture::new(2);
    fixture.trainer().train(None).await.unwrap();

    fixture.config.training.num_epochs = 4;
    let mut trainer = fixture.trainer();
    assert!(trainer.load_checkpoint().await.unwrap());
    assert_eq!((trainer.state().epoch, trainer.state().minibatch), (3, 0));
    assert_eq!(trainer.state().history.len(), 2);
    assert_eq!(trainer.state().global_step, 2 * BATCHES);
}

#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_run() {
    let uninterrupted = TrainingTestFixture::new(4);
    let mut reference = uninterrupted.trainer();
    reference.train(None).await.unwrap();

    let mut fixture = TrainingTestFixture::new(2);
    fixture.trainer().train(None).await.unwrap();
    fixture.config.training.num_epochs = 4;
    let mut resumed = fixture.trainer();
    resumed.load_checkpoint().await.unwrap();
    resumed.train(None).await.unwrap();

    let expected = parameter_values(reference.model());
    let actual = parameter_values(resumed.model());
    assert_eq!(expected.len(), actual.len());
    for (a, b) in expected.iter().zip(&actual) {
        assert_relative_eq!(a, b, epsilon = 1e-6);
    }
    assert_eq!(reference.state().global_step, resumed.state().global_step);
}

#[tokio::test]
async fn test_mid_epoch_resume_skips_finished_minibatches() {
    let fixture = TrainingTestFixture::new(1);
    fixture.trainer().train(None).await.unwrap();

    // Pretend the run stopped after minibatch 1 of epoch 1
    let store = fixture.trainer().store().clone();
    let mut record = store.load(CheckpointSlot::Latest).unwrap();
    record.training_state.epoch = 1;
    record.training_state.minibatch = 1;
    record.training_state.history.clear();
    store.save(CheckpointSlot::Latest, &record).unwrap();

    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);
    assert!(trainer.load_checkpoint().await.unwrap());
    assert_eq!((trainer.state().epoch, trainer.state().minibatch), (1, 2));

    trainer.train(None).await.unwrap();
    let events = drain_events(&mut rx);
    assert!(matches!(
        events.first(),
        Some(TrainingEvent::EpochStarted {
            epoch: 1,
            start_minibatch: 2
        })
    ));
    let trained: Vec<usize> = events
        .iter()
        .filter_map(|event| match event {
            TrainingEvent::MinibatchCompleted { minibatch, .. } => Some(*minibatch),
            _ => None,
        })
        .collect();
    assert_eq!(trained, vec![2, 3]);
}

#[tokio::test]
async fn test_save_every_writes_mid_epoch_positions() {
    let mut fixture = TrainingTestFixture::new(1);
    fixture.config.training.save_every = 1;
    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);
    trainer.train(None).await.unwrap();

    let latest_saves = drain_events(&mut rx)
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                TrainingEvent::CheckpointSaved {
                    slot: CheckpointSlot::Latest,
                    ..
                }
            )
        })
        .count();
    // One per non-final minibatch plus the two end-of-epoch writes
    assert_eq!(latest_saves, BATCHES - 1 + 2);
}

#[tokio::test]
async fn test_mid_epoch_resume_does_not_restart_schedule() {
    let mut fixture = TrainingTestFixture::new(3);
    fixture.config.scheduler.scheduler_type = SchedulerType::Cosine { min_lr: 0.0 };
    fixture.config.scheduler.restart_epochs = vec![2];
    fixture.trainer().train(None).await.unwrap();

    // Stopped after minibatch 0 of the restart epoch
    let store = fixture.trainer().store().clone();
    let mut record = store.load(CheckpointSlot::Latest).unwrap();
    record.training_state.epoch = 2;
    record.training_state.minibatch = 0;
    store.save(CheckpointSlot::Latest, &record).unwrap();

    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);
    trainer.load_checkpoint().await.unwrap();
    trainer.train(None).await.unwrap();

    let restarts = drain_events(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, TrainingEvent::WarmRestart { .. }))
        .count();
    assert_eq!(restarts, 0);
}

#[tokio::test]
async fn test_early_stopped_run_stays_stopped_on_resume() {
    let mut fixture = TrainingTestFixture::new(10);
    fixture.config.training.patience = Some(2);
    let (mut first, _rx) = fixture.scripted_trainer(&[(0.9, 0.5), (0.5, 0.6), (0.6, 0.7), (0.7, 0.8)]);
    let outcome = first.train(None).await.unwrap();
    assert!(matches!(outcome, TrainingOutcome::EarlyStopped(_)));
    assert_eq!(outcome.summary().final_epoch, 4);

    let store = first.store().clone();
    let before = store.load(CheckpointSlot::Latest).unwrap();

    let (mut trainer, mut rx) = fixture.scripted_trainer(&[]);
    assert!(trainer.load_checkpoint().await.unwrap());
    let outcome = trainer.train(None).await.unwrap();

    assert!(matches!(outcome, TrainingOutcome::EarlyStopped(_)));
    assert_eq!(outcome.summary().final_epoch, 4);
    assert_eq!(outcome.summary().best_loss.as_ref().unwrap().epoch, 2);
    assert!(!drain_events(&mut rx)
        .iter()
        .any(|event| matches!(event, TrainingEvent::EpochStarted { .. })));

    let after = store.load(CheckpointSlot::Latest).unwrap();
    assert_eq!(
        (after.training_state.epoch, after.training_state.minibatch),
        (before.training_state.epoch, before.training_state.minibatch)
    );
    assert_eq!(after.training_state.global_step, 4 * BATCHES);
}
