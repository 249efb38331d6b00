//! Experiment tracking.
//!
//! Hosted tracking services sit behind [`ExperimentTracker`]. [`RunDirTracker`]
//! keeps the same information in a local run directory: the resolved config,
//! a JSON-lines history, and debug images as PNM files.

use super::CheckpointRecord;
use crate::image::DebugImage;
use crate::metrics::MetricsTracker;
use ccnet_core::persistence::{write_bytes_atomic, write_json_atomic};
use ccnet_core::{Result, TrainConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Receives run configuration plus train / eval data at checkpoints.
pub trait ExperimentTracker {
    fn init(&mut self, config: &TrainConfig) -> Result<()>;

    fn log_train(&mut self, record: &CheckpointRecord, image: Option<&DebugImage>) -> Result<()>;

    fn log_eval(
        &mut self,
        iteration: usize,
        results: &MetricsTracker,
        image: Option<&DebugImage>,
    ) -> Result<()>;
}

/// One line of `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Train {
        record: CheckpointRecord,
        image: Option<PathBuf>,
        logged_at: DateTime<Utc>,
    },
    Eval {
        iteration: usize,
        results: MetricsTracker,
        image: Option<PathBuf>,
        logged_at: DateTime<Utc>,
    },
}

/// Offline tracker writing under `<root>/<run_id>/`.
#[derive(Debug)]
pub struct RunDirTracker {
    run_id: String,
    dir: PathBuf,
}

impl RunDirTracker {
    pub fn new(root: &Path) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        let dir = root.join(&run_id);
        Self { run_id, dir }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    pub fn read_history(&self) -> Result<Vec<HistoryEntry>> {
        let content = std::fs::read_to_string(self.history_path())?;
        content
            .lines()
            .map(|line| -> Result<HistoryEntry> { Ok(serde_json::from_str(line)?) })
            .collect()
    }

    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    fn store_image(&self, label: &str, image: Option<&DebugImage>) -> Result<Option<PathBuf>> {
        let Some(image) = image else {
            return Ok(None);
        };
        let path = self.dir.join("images").join(format!("{label}.pnm"));
        write_bytes_atomic(&path, &image.to_pnm()?)?;
        Ok(Some(path))
    }
}

impl ExperimentTracker for RunDirTracker {
    fn init(&mut self, config: &TrainConfig) -> Result<()> {
        write_json_atomic(&self.dir.join("config.json"), config)?;
        tracing::info!(run_id = %self.run_id, dir = %self.dir.display(), "Experiment tracking started");
        Ok(())
    }

    fn log_train(&mut self, record: &CheckpointRecord, image: Option<&DebugImage>) -> Result<()> {
        let image = self.store_image(&format!("train_{}", record.iteration), image)?;
        self.append(&HistoryEntry::Train {
            record: record.clone(),
            image,
            logged_at: Utc::now(),
        })
    }

    fn log_eval(
        &mut self,
        iteration: usize,
        results: &MetricsTracker,
        image: Option<&DebugImage>,
    ) -> Result<()> {
        let image = self.store_image(&format!("eval_{iteration}"), image)?;
        self.append(&HistoryEntry::Eval {
            iteration,
            results: results.clone(),
            image,
            logged_at: Utc::now(),
        })
    }
}
