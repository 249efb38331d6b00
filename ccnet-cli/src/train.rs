//! Synthetic end-to-end training run.
//!
//! Observations are uniform noise in `[-1, 1]`; labels are a fixed random
//! linear map of the observation. The loop drives the encoder (when enabled)
//! and core trainers and hands every step to the hub.

use anyhow::Context;
use ccnet_core::TrainConfig;
use ccnet_train::checkpoint::{self, CheckpointEntry};
use ccnet_train::hub::{StepContext, TrainerHubHelper, TrainerRefs};
use ccnet_train::metrics::MetricsTracker;
use ccnet_train::tensor_utils::generate_padding_mask;
use ccnet_train::trainer::{
    CooperativeTrainer, Encoder, NetworkTrainer, ROLE_CORE, ROLE_ENCODER,
};
use ndarray::{Array2, ArrayD, Axis, IxDyn, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

const BATCH_SIZE: usize = 32;
const TRAIN_SAMPLES: usize = 512;
const TEST_SAMPLES: usize = 128;

#[derive(Debug)]
pub struct RunSummary {
    pub iterations: usize,
    pub checkpoints: usize,
    pub saves: usize,
    pub final_metrics: MetricsTracker,
}

struct SyntheticData {
    train_obs: Array2<f32>,
    train_labels: Array2<f32>,
    test_obs: Array2<f32>,
    test_labels: Array2<f32>,
}

impl SyntheticData {
    fn generate<R: Rng>(obs_size: usize, label_size: usize, rng: &mut R) -> Self {
        let mapping = Array2::from_shape_fn((obs_size, label_size), |_| rng.gen_range(-1.0f32..1.0));
        let mut sample = |n: usize| {
            let obs = Array2::from_shape_fn((n, obs_size), |_| rng.gen_range(-1.0f32..1.0));
            let labels = obs.dot(&mapping);
            (obs, labels)
        };
        let (train_obs, train_labels) = sample(TRAIN_SAMPLES);
        let (test_obs, test_labels) = sample(TEST_SAMPLES);
        Self {
            train_obs,
            train_labels,
            test_obs,
            test_labels,
        }
    }

    fn len_dataloader(&self) -> usize {
        self.train_obs.nrows().div_ceil(BATCH_SIZE)
    }

    /// Batch `idx` with the observation reshaped to `[batch, obs_shape...]`.
    fn batch(&self, idx: usize, obs_shape: &[usize]) -> anyhow::Result<(ArrayD<f32>, ArrayD<f32>)> {
        let start = idx * BATCH_SIZE;
        let end = (start + BATCH_SIZE).min(self.train_obs.nrows());
        let obs = shape_observation(
            self.train_obs.slice(s![start..end, ..]).to_owned(),
            obs_shape,
        )?;
        Ok((obs, self.train_labels.slice(s![start..end, ..]).to_owned().into_dyn()))
    }

    /// Training observations at `indices`, each shaped `obs_shape`.
    fn samples(&self, indices: &[usize], obs_shape: &[usize]) -> anyhow::Result<Vec<ArrayD<f32>>> {
        indices
            .iter()
            .filter(|i| **i < self.train_obs.nrows())
            .map(|i| {
                let row = self.train_obs.index_axis(Axis(0), *i).to_owned();
                row.into_shape_with_order(IxDyn(obs_shape))
                    .context("observation does not fit obs_shape")
            })
            .collect()
    }
}

fn shape_observation(obs: Array2<f32>, obs_shape: &[usize]) -> anyhow::Result<ArrayD<f32>> {
    let mut shape = vec![obs.nrows()];
    shape.extend_from_slice(obs_shape);
    obs.into_shape_with_order(IxDyn(&shape))
        .context("observation does not fit obs_shape")
}

/// Directory among `dirs` whose manifest holds the newest entry for `role`.
fn newest_snapshot_dir<'a>(dirs: &[&'a Path], role: &str) -> anyhow::Result<Option<&'a Path>> {
    let mut newest: Option<(CheckpointEntry, &'a Path)> = None;
    for dir in dirs {
        if let Some(entry) = checkpoint::latest(dir, role)? {
            let is_newer = newest.as_ref().is_none_or(|(best, _)| {
                (entry.iteration, entry.created_at) > (best.iteration, best.created_at)
            });
            if is_newer {
                newest = Some((entry, *dir));
            }
        }
    }
    Ok(newest.map(|(_, dir)| dir))
}

pub fn run(config: &TrainConfig, seed: u64, resume: bool) -> anyhow::Result<RunSummary> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data_config = &config.data;
    let obs_size = data_config.obs_size();
    let data = SyntheticData::generate(obs_size, data_config.label_size, &mut rng);

    let mut encoder = if config.encoder.enabled {
        Some(CooperativeTrainer::new(
            ROLE_ENCODER,
            &config.encoder,
            obs_size,
            data_config.label_size,
            data_config.explain_size,
            config.total_iterations,
            &mut rng,
        )?)
    } else {
        None
    };
    let core_input = if encoder.is_some() {
        data_config.explain_size
    } else {
        obs_size
    };
    let mut core = if config.core.enabled {
        Some(CooperativeTrainer::new(
            ROLE_CORE,
            &config.core,
            core_input,
            data_config.label_size,
            data_config.explain_size,
            config.total_iterations,
            &mut rng,
        )?)
    } else {
        None
    };
    if core.is_none() && encoder.is_none() {
        anyhow::bail!("Nothing to train: both core and encoder are disabled");
    }

    let mut hub = TrainerHubHelper::from_config(config)?;
    if resume {
        for trainer in [core.as_mut(), encoder.as_mut()].into_iter().flatten() {
            let dir = newest_snapshot_dir(&[hub.model_path(), hub.temp_path()], trainer.role())?
                .unwrap_or(hub.model_path());
            let snapshot = checkpoint::load_trainer(dir, trainer.role())?;
            tracing::info!(role = trainer.role(), path = %dir.display(), "Resuming from snapshot");
            trainer.restore(&snapshot)?;
        }
    }

    let display_samples = match &data_config.show_image_indices {
        Some(indices) if data_config.is_image() => Some(data.samples(indices, &data_config.obs_shape)?),
        _ => None,
    };
    hub.initialize_train(display_samples.as_deref())?;

    let test_obs = shape_observation(data.test_obs.clone(), &data_config.obs_shape)?;
    let test_labels = data.test_labels.clone().into_dyn();

    let len_dataloader = data.len_dataloader();
    let mut summary = RunSummary {
        iterations: 0,
        checkpoints: 0,
        saves: 0,
        final_metrics: MetricsTracker::new(),
    };

    'epochs: for epoch_idx in 0..config.hub.num_epoch.max(1) {
        for iter_idx in 0..len_dataloader {
            if summary.iterations >= config.total_iterations {
                break 'epochs;
            }
            hub.init_time_step();

            let (obs, labels) = data.batch(iter_idx, &data_config.obs_shape)?;
            let mask = if config.hub.use_gpt {
                Some(generate_padding_mask(&obs)?)
            } else {
                None
            };
            let batch = hub.prepare_batch_data(obs, labels, mask)?;

            let encoder_metric = match encoder.as_mut() {
                Some(encoder) => Some(encoder.train_step(&batch.source, &batch.target)?),
                None => None,
            };
            let (core_obs, core_labels) = hub.encode_inputs(
                batch.source,
                batch.target,
                batch.padding_mask.as_ref(),
                encoder.as_ref().map(|e| e as &dyn Encoder),
            )?;
            let core_metric = match core.as_mut() {
                Some(core) => Some(core.train_step(&core_obs, &core_labels)?),
                None => None,
            };

            let test_results = match (&core, hub.should_checkpoint()) {
                (Some(core), true) => {
                    let (encoded, labels) = hub.encode_inputs(
                        test_obs.clone(),
                        test_labels.clone(),
                        None,
                        encoder.as_ref().map(|e| e as &dyn Encoder),
                    )?;
                    Some(core.evaluate(&encoded, &labels)?)
                }
                _ => None,
            };

            let outcome = hub.finalize_training_step(
                StepContext {
                    epoch_idx,
                    iter_idx,
                    len_dataloader,
                },
                core_metric.as_ref(),
                encoder_metric.as_ref(),
                test_results.as_ref(),
                &TrainerRefs {
                    core: core.as_ref().map(|c| c as &dyn NetworkTrainer),
                    encoder: encoder.as_ref().map(|e| e as &dyn NetworkTrainer),
                },
            )?;

            summary.iterations += 1;
            summary.checkpoints += usize::from(outcome.checkpointed);
            summary.saves += usize::from(outcome.saved);
            if let Some(results) = test_results {
                summary.final_metrics = results;
            }
        }
    }
    hub.flush()?;

    if summary.final_metrics.is_empty() {
        if let Some(core) = &core {
            let (encoded, labels) = hub.encode_inputs(
                test_obs,
                test_labels,
                None,
                encoder.as_ref().map(|e| e as &dyn Encoder),
            )?;
            summary.final_metrics = core.evaluate(&encoded, &labels)?;
        }
    }
    tracing::info!(
        iterations = summary.iterations,
        checkpoints = summary.checkpoints,
        "Training finished"
    );
    Ok(summary)
}
