//! Scalar event log, one JSON object per line, in the spirit of a tensorboard
//! event file: `{"tag": "train/core/prediction_loss", "step": 200, ...}`.

use super::{CheckpointRecord, MetricsSink};
use crate::metrics::MetricsTracker;
use ccnet_core::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const EVENTS_FILE_NAME: &str = "scalars.jsonl";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub step: usize,
    pub value: f64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Timestamped run directory name, e.g. `20261016-135800_synthetic`.
pub fn run_name(dataset_name: &str) -> String {
    format!("{}_{}", Utc::now().format("%Y%m%d-%H%M%S"), dataset_name)
}

/// Appends [`ScalarEvent`]s to `<log_dir>/<run>/scalars.jsonl`.
pub struct ScalarEventSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarEventSink {
    pub fn create(log_dir: &Path, run: &str) -> Result<Self> {
        let dir = log_dir.join(run);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(EVENTS_FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::debug!(path = %path.display(), "Opened scalar event log");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_scalar(&mut self, tag: String, step: usize, value: f64) -> Result<()> {
        let now = Utc::now();
        let event = ScalarEvent {
            tag,
            step,
            value,
            wall_time: now.timestamp_millis() as f64 / 1000.0,
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Read back every event in a log file.
    pub fn read_events(path: &Path) -> Result<Vec<ScalarEvent>> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| -> Result<ScalarEvent> { Ok(serde_json::from_str(line)?) })
            .collect()
    }
}

impl MetricsSink for ScalarEventSink {
    fn name(&self) -> &str {
        "scalar_events"
    }

    fn log_train(&mut self, record: &CheckpointRecord) -> Result<()> {
        for trainer in record.trainers() {
            for (name, value) in trainer.metrics.iter() {
                self.write_scalar(
                    format!("train/{}/{}", trainer.role, name),
                    record.iteration,
                    value,
                )?;
            }
        }
        if let Some(lr) = record.lr {
            self.write_scalar("train/lr".to_string(), record.iteration, lr)?;
        }
        self.flush()
    }

    fn log_eval(&mut self, iteration: usize, results: &MetricsTracker) -> Result<()> {
        for (name, value) in results.iter() {
            self.write_scalar(format!("eval/{name}"), iteration, value)?;
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::TrainerSummary;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_events_are_tagged_and_appended() {
        let dir = TempDir::new().unwrap();
        let mut sink = ScalarEventSink::create(dir.path(), "run").unwrap();
        let record = CheckpointRecord {
            iteration: 40,
            epoch_idx: 0,
            num_epoch: 1,
            iter_idx: 40,
            len_dataloader: 100,
            elapsed_secs: 0.1,
            lr: Some(1e-3),
            core: Some(TrainerSummary {
                role: "core".into(),
                model_name: "m".into(),
                learning_rates: vec![1e-3],
                metrics: MetricsTracker::new().with("loss", 0.5),
            }),
            encoder: None,
        };
        sink.log_train(&record).unwrap();
        sink.log_eval(40, &MetricsTracker::new().with("accuracy", 0.75))
            .unwrap();

        let events = ScalarEventSink::read_events(sink.path()).unwrap();
        let tags: Vec<(&str, usize, f64)> = events
            .iter()
            .map(|e| (e.tag.as_str(), e.step, e.value))
            .collect();
        assert_eq!(
            tags,
            vec![
                ("train/core/loss", 40, 0.5),
                ("train/lr", 40, 1e-3),
                ("eval/accuracy", 40, 0.75),
            ]
        );
    }

    #[test]
    fn test_run_name_carries_dataset() {
        assert!(run_name("mnist").ends_with("_mnist"));
    }
}
