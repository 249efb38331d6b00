//! Per-iteration bookkeeping around the trainers.
//!
//! The driver steps its trainers, then calls
//! [`TrainerHubHelper::finalize_training_step`]. The hub accumulates metrics,
//! and every `print_interval` calls it logs averaged metrics to its sinks and
//! tracker and snapshots the trainers. Snapshots alternate between
//! `<base>/models` and `<base>/models/temp`; every `save_interval` calls a
//! snapshot also lands in `<base>/models`.

use crate::checkpoint;
use crate::image::{DebugImage, ImageDebugger, SampleGridDebugger};
use crate::metrics::MetricsTracker;
use crate::sinks::{
    CheckpointRecord, ConsoleSink, ExperimentTracker, MetricsSink, RunDirTracker,
    ScalarEventSink, TrainerSummary, run_name,
};
use crate::tensor_utils::{adjust_optional_dim, adjust_tensor_dim};
use crate::trainer::{Encoder, NetworkTrainer};
use ccnet_core::persistence::ensure_dirs;
use ccnet_core::{DataConfig, HubConfig, Result, TrainConfig};
use ndarray::ArrayD;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rank sequence models expect: `[batch, sequence, feature]`.
const SEQUENCE_RANK: usize = 3;

/// `counter` is a positive multiple of `interval`. A zero interval is never due.
pub fn interval_due(counter: usize, interval: usize) -> bool {
    interval != 0 && counter != 0 && counter % interval == 0
}

/// Position of the current step within the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepContext {
    pub epoch_idx: usize,
    pub iter_idx: usize,
    pub len_dataloader: usize,
}

/// Trainers taking part in the run; an absent role is simply skipped.
#[derive(Default, Clone, Copy)]
pub struct TrainerRefs<'a> {
    pub core: Option<&'a dyn NetworkTrainer>,
    pub encoder: Option<&'a dyn NetworkTrainer>,
}

impl<'a> TrainerRefs<'a> {
    fn iter(&self) -> impl Iterator<Item = &'a dyn NetworkTrainer> {
        self.core.into_iter().chain(self.encoder)
    }
}

/// What a call to [`TrainerHubHelper::finalize_training_step`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub checkpointed: bool,
    pub saved: bool,
}

/// Batch tensors after shape normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub source: ArrayD<f32>,
    pub target: ArrayD<f32>,
    pub padding_mask: Option<ArrayD<f32>>,
}

pub struct TrainerHubHelper {
    hub: HubConfig,
    data: DataConfig,
    sinks: Vec<Box<dyn MetricsSink>>,
    tracker: Option<Box<dyn ExperimentTracker>>,
    image_debugger: Option<Box<dyn ImageDebugger>>,

    model_path: PathBuf,
    temp_path: PathBuf,
    log_path: PathBuf,

    pivot_time: Option<Instant>,
    core_metrics: MetricsTracker,
    encoder_metrics: MetricsTracker,

    iters: usize,
    cnt_checkpoints: usize,
    cnt_save: usize,
    cnt_print: usize,
}

impl TrainerHubHelper {
    /// Create the model, temp and log directories under `hub.base_path` and
    /// start the tracker run when one is given.
    pub fn new(
        config: &TrainConfig,
        sinks: Vec<Box<dyn MetricsSink>>,
        mut tracker: Option<Box<dyn ExperimentTracker>>,
        image_debugger: Option<Box<dyn ImageDebugger>>,
    ) -> Result<Self> {
        let (model_path, temp_path, log_path) = Self::setup_directories(&config.hub.base_path)?;
        if let Some(tracker) = tracker.as_mut() {
            tracker.init(config)?;
        }

        Ok(Self {
            hub: config.hub.clone(),
            data: config.data.clone(),
            sinks,
            tracker,
            image_debugger,
            model_path,
            temp_path,
            log_path,
            pivot_time: None,
            core_metrics: MetricsTracker::new(),
            encoder_metrics: MetricsTracker::new(),
            iters: 0,
            cnt_checkpoints: 0,
            cnt_save: 0,
            cnt_print: 0,
        })
    }

    /// Hub with the outputs `config` asks for: console when `use_print`, a
    /// scalar event log under `<base>/logs`, a run-directory tracker when
    /// `use_tracker`, and a sample grid when image indices are configured.
    pub fn from_config(config: &TrainConfig) -> Result<Self> {
        let log_path = config.hub.base_path.join("logs");
        let mut sinks: Vec<Box<dyn MetricsSink>> = Vec::new();
        if config.hub.use_print {
            sinks.push(Box::new(ConsoleSink::stdout()));
        }
        sinks.push(Box::new(ScalarEventSink::create(
            &log_path,
            &run_name(&config.data.dataset_name),
        )?));

        let tracker: Option<Box<dyn ExperimentTracker>> = config
            .hub
            .use_tracker
            .then(|| Box::new(RunDirTracker::new(&log_path.join("tracker"))) as _);

        let wants_images = config.data.is_image() && config.data.show_image_indices.is_some();
        let renderable = SampleGridDebugger::supports(&config.data.obs_shape);
        if wants_images && !renderable {
            warn!(
                obs_shape = ?config.data.obs_shape,
                "Debug images need [H, W] or [1|3, H, W] observations; image debugging disabled"
            );
        }
        let image_debugger: Option<Box<dyn ImageDebugger>> = (wants_images && renderable)
            .then(|| Box::new(SampleGridDebugger::new()) as _);

        Self::new(config, sinks, tracker, image_debugger)
    }

    fn setup_directories(base: &Path) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let model_path = base.join("models");
        let temp_path = model_path.join("temp");
        let log_path = base.join("logs");
        ensure_dirs([&model_path, &temp_path, &log_path])?;
        debug!(base = %base.display(), "Prepared hub directories");
        Ok((model_path, temp_path, log_path))
    }

    /// Reset all counters and hand the display samples to the image debugger.
    ///
    /// `dataset_samples` are the observations at `show_image_indices`.
    pub fn initialize_train(&mut self, dataset_samples: Option<&[ArrayD<f32>]>) -> Result<()> {
        self.iters = 0;
        self.cnt_checkpoints = 0;
        self.cnt_print = 0;
        self.cnt_save = 0;
        if let (Some(debugger), Some(samples)) = (self.image_debugger.as_mut(), dataset_samples) {
            debugger.initialize(samples)?;
        }
        Ok(())
    }

    /// Start timing the current checkpoint interval, if not already started.
    pub fn init_time_step(&mut self) {
        if self.pivot_time.is_none() {
            self.pivot_time = Some(Instant::now());
        }
    }

    pub fn should_checkpoint(&self) -> bool {
        interval_due(self.cnt_checkpoints, self.hub.print_interval)
    }

    pub fn should_save_model(&self) -> bool {
        interval_due(self.cnt_save, self.hub.save_interval)
    }

    /// Permanent directory on even checkpoints, temp on odd ones.
    pub fn determine_save_path(&self) -> &Path {
        if self.cnt_print % 2 == 0 {
            &self.model_path
        } else {
            &self.temp_path
        }
    }

    /// Bring source, target and mask to rank 3 for sequence models; otherwise
    /// pass them through.
    pub fn prepare_batch_data(
        &self,
        source: ArrayD<f32>,
        target: ArrayD<f32>,
        padding_mask: Option<ArrayD<f32>>,
    ) -> Result<PreparedBatch> {
        if !self.hub.use_gpt {
            return Ok(PreparedBatch {
                source,
                target,
                padding_mask,
            });
        }
        Ok(PreparedBatch {
            source: adjust_tensor_dim(source, SEQUENCE_RANK)?,
            target: adjust_tensor_dim(target, SEQUENCE_RANK)?,
            padding_mask: adjust_optional_dim(padding_mask, SEQUENCE_RANK)?,
        })
    }

    /// Run the observation through `encoder` when there is one; labels pass through.
    pub fn encode_inputs(
        &self,
        observation: ArrayD<f32>,
        labels: ArrayD<f32>,
        padding_mask: Option<&ArrayD<f32>>,
        encoder: Option<&dyn Encoder>,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        let encoded = match encoder {
            Some(encoder) => encoder.encode(&observation, padding_mask)?,
            None => observation,
        };
        Ok((encoded, labels))
    }

    /// End-of-step bookkeeping: accumulate metrics, checkpoint and save when
    /// due, then advance the counters.
    pub fn finalize_training_step(
        &mut self,
        ctx: StepContext,
        core_metric: Option<&MetricsTracker>,
        encoder_metric: Option<&MetricsTracker>,
        test_results: Option<&MetricsTracker>,
        trainers: &TrainerRefs<'_>,
    ) -> Result<StepOutcome> {
        self.update_metrics(core_metric, encoder_metric);

        let checkpointed = self.should_checkpoint();
        // The checkpoint writes to the permanent directory before resetting, which bumps `cnt_print`.
        let checkpoint_in_models = checkpointed && self.cnt_print % 2 == 0;
        if checkpointed {
            self.perform_checkpoint_operations(ctx, test_results, trainers)?;
        }

        let saved = self.should_save_model();
        if saved && !checkpoint_in_models {
            let dir = self.model_path.clone();
            self.save_trainers(&dir, trainers)?;
            info!(iteration = self.iters, path = %dir.display(), "Saved models");
        }

        self.increment_counters();
        Ok(StepOutcome {
            checkpointed,
            saved,
        })
    }

    pub fn update_metrics(
        &mut self,
        core_metric: Option<&MetricsTracker>,
        encoder_metric: Option<&MetricsTracker>,
    ) {
        if let Some(metric) = core_metric {
            self.core_metrics += metric;
        }
        if let Some(metric) = encoder_metric {
            self.encoder_metrics += metric;
        }
    }

    /// Log, snapshot, reset, then report test results.
    pub fn perform_checkpoint_operations(
        &mut self,
        ctx: StepContext,
        test_results: Option<&MetricsTracker>,
        trainers: &TrainerRefs<'_>,
    ) -> Result<()> {
        let elapsed_secs = self
            .pivot_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let image = self.update_image()?;

        let record = self.log_checkpoint_details(ctx, elapsed_secs, image.as_ref(), trainers)?;
        let dir = self.determine_save_path().to_path_buf();
        self.save_trainers(&dir, trainers)?;
        info!(
            iteration = self.iters,
            elapsed_secs,
            lr = record.lr,
            path = %dir.display(),
            "Checkpoint"
        );
        self.reset_metrics();

        if let (Some(_), Some(results)) = (trainers.core, test_results) {
            self.handle_test_results(results, image.as_ref())?;
        }
        Ok(())
    }

    /// Average the accumulated metrics over the interval and send them to
    /// every sink and the tracker.
    pub fn log_checkpoint_details(
        &mut self,
        ctx: StepContext,
        elapsed_secs: f64,
        image: Option<&DebugImage>,
        trainers: &TrainerRefs<'_>,
    ) -> Result<CheckpointRecord> {
        let interval = self.hub.print_interval.max(1) as f64;
        let summarize = |trainer: &dyn NetworkTrainer, metrics: &MetricsTracker| TrainerSummary {
            role: trainer.role().to_string(),
            model_name: trainer.model_name().to_string(),
            learning_rates: trainer.learning_rates(),
            metrics: metrics / interval,
        };

        let record = CheckpointRecord {
            iteration: self.iters,
            epoch_idx: ctx.epoch_idx,
            num_epoch: self.hub.num_epoch,
            iter_idx: ctx.iter_idx,
            len_dataloader: ctx.len_dataloader,
            elapsed_secs,
            lr: trainers.core.map(|t| t.get_lr()),
            core: trainers.core.map(|t| summarize(t, &self.core_metrics)),
            encoder: trainers.encoder.map(|t| summarize(t, &self.encoder_metrics)),
        };

        for sink in &mut self.sinks {
            sink.log_train(&record)?;
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.log_train(&record, image)?;
        }
        Ok(record)
    }

    pub fn save_trainers(&self, dir: &Path, trainers: &TrainerRefs<'_>) -> Result<()> {
        for trainer in trainers.iter() {
            checkpoint::save_trainer(dir, trainer, self.iters, self.hub.max_checkpoints)?;
        }
        Ok(())
    }

    /// Start a new checkpoint interval.
    pub fn reset_metrics(&mut self) {
        self.pivot_time = None;
        self.core_metrics.reset();
        self.encoder_metrics.reset();
        self.cnt_checkpoints = 0;
        self.cnt_print += 1;
    }

    pub fn handle_test_results(
        &mut self,
        results: &MetricsTracker,
        image: Option<&DebugImage>,
    ) -> Result<()> {
        for sink in &mut self.sinks {
            sink.log_eval(self.iters, results)?;
        }
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.log_eval(self.iters, results, image)?;
        }
        Ok(())
    }

    pub fn increment_counters(&mut self) {
        self.iters += 1;
        self.cnt_checkpoints += 1;
        self.cnt_save += 1;
    }

    /// Refresh the debugger and return its picture.
    pub fn update_image(&mut self) -> Result<Option<DebugImage>> {
        match self.image_debugger.as_mut() {
            Some(debugger) => {
                debugger.update_images()?;
                Ok(debugger.display_image())
            }
            None => Ok(None),
        }
    }

    pub fn iters(&self) -> usize {
        self.iters
    }

    pub fn cnt_checkpoints(&self) -> usize {
        self.cnt_checkpoints
    }

    pub fn cnt_print(&self) -> usize {
        self.cnt_print
    }

    pub fn cnt_save(&self) -> usize {
        self.cnt_save
    }

    pub fn core_metrics(&self) -> &MetricsTracker {
        &self.core_metrics
    }

    pub fn encoder_metrics(&self) -> &MetricsTracker {
        &self.encoder_metrics
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn data_config(&self) -> &DataConfig {
        &self.data
    }

    /// Flush every sink, e.g. at the end of a run.
    pub fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}
