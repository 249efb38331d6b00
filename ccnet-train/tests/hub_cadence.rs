//! Checkpoint cadence of the hub, driven end to end with a real trainer.

use proptest::prelude::*;

use ccnet_core::TrainConfig;
use ccnet_train::checkpoint;
use ccnet_train::hub::{StepContext, TrainerHubHelper, TrainerRefs, interval_due};
use ccnet_train::sinks::{MetricsSink, ScalarEventSink, run_name};
use ccnet_train::trainer::{CooperativeTrainer, NetworkTrainer, ROLE_CORE};
use ndarray::Array;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

proptest! {
    #[test]
    fn due_exactly_on_positive_multiples(counter in 0usize..10_000, interval in 1usize..500) {
        prop_assert_eq!(
            interval_due(counter, interval),
            counter > 0 && counter % interval == 0
        );
    }

    #[test]
    fn zero_interval_is_never_due(counter in 0usize..10_000) {
        prop_assert!(!interval_due(counter, 0));
    }
}

#[test]
fn test_training_run_checkpoints_and_saves() {
    let dir = TempDir::new().unwrap();
    let mut config = TrainConfig::default();
    config.hub.base_path = dir.path().to_path_buf();
    config.hub.print_interval = 5;
    config.hub.save_interval = 20;
    config.hub.use_print = false;
    config.total_iterations = 40;

    let mut rng = StdRng::seed_from_u64(42);
    let obs_size = config.data.obs_size();
    let mut core = CooperativeTrainer::new(
        ROLE_CORE,
        &config.core,
        obs_size,
        config.data.label_size,
        config.data.explain_size,
        config.total_iterations,
        &mut rng,
    )
    .unwrap();

    let log_dir = dir.path().join("logs");
    let run = run_name(&config.data.dataset_name);
    let sink = ScalarEventSink::create(&log_dir, &run).unwrap();
    let events_path = sink.path().to_path_buf();
    let sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(sink)];
    let mut hub = TrainerHubHelper::new(&config, sinks, None, None).unwrap();
    hub.initialize_train(None).unwrap();

    let obs = Array::from_shape_fn((4, obs_size), |(i, j)| ((i + j) % 3) as f32 - 1.0).into_dyn();
    let labels =
        Array::from_shape_fn((4, config.data.label_size), |(i, j)| (i * j) as f32 * 0.1).into_dyn();

    let mut checkpoints = 0;
    let mut saves = 0;
    for iter_idx in 0..config.total_iterations {
        hub.init_time_step();
        let metric = core.train_step(&obs, &labels).unwrap();
        let test_results = core.evaluate(&obs, &labels).unwrap();
        let outcome = hub
            .finalize_training_step(
                StepContext {
                    epoch_idx: 0,
                    iter_idx,
                    len_dataloader: config.total_iterations,
                },
                Some(&metric),
                None,
                Some(&test_results),
                &TrainerRefs {
                    core: Some(&core),
                    encoder: None,
                },
            )
            .unwrap();
        checkpoints += usize::from(outcome.checkpointed);
        saves += usize::from(outcome.saved);
    }

    // Checkpoints at 5, 10, ..., 35; saves at 20.
    assert_eq!(checkpoints, 7);
    assert_eq!(saves, 1);
    assert_eq!(hub.cnt_print(), 7);

    let saved = checkpoint::load_trainer(hub.model_path(), ROLE_CORE).unwrap();
    assert_eq!(saved.networks.len(), 3);
    assert!(checkpoint::load_trainer(hub.temp_path(), ROLE_CORE).is_ok());

    let entry = checkpoint::latest(hub.model_path(), ROLE_CORE)
        .unwrap()
        .unwrap();
    assert!(checkpoint::verify(&entry).unwrap());

    let events = ScalarEventSink::read_events(&events_path).unwrap();
    let lr_events = events.iter().filter(|e| e.tag == "train/lr").count();
    let eval_events = events
        .iter()
        .filter(|e| e.tag == "eval/prediction_loss")
        .count();
    assert_eq!(lr_events, 7);
    assert_eq!(eval_events, 7);
    assert!(events.iter().all(|e| e.value.is_finite()));
    assert!(core.get_lr() < config.core.learning.lr);
}
