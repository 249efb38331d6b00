use super::{CheckpointRecord, MetricsSink, TrainerSummary};
use crate::metrics::MetricsTracker;
use ccnet_core::Result;
use std::io::{self, Write};

const TRAIN_BANNER: &str = "--------------------Training Metrics--------------------";
const TEST_BANNER: &str = "----------------------Test Metrics----------------------";

/// Human-readable checkpoint summaries.
pub struct ConsoleSink<W: Write = io::Stdout> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn print_iter(&mut self, record: &CheckpointRecord) -> io::Result<()> {
        writeln!(
            self.out,
            "[Epoch {}/{}][Iter {}/{}] Time: {:.2} sec",
            record.epoch_idx + 1,
            record.num_epoch,
            record.iter_idx + 1,
            record.len_dataloader,
            record.elapsed_secs
        )
    }

    fn print_lr(&mut self, trainer: &TrainerSummary) -> io::Result<()> {
        let rates: Vec<String> = trainer
            .learning_rates
            .iter()
            .map(|lr| format!("{lr:.3e}"))
            .collect();
        writeln!(self.out, "LR ({}): {}", trainer.role, rates.join(" | "))
    }

    fn print_metrics(&mut self, title: &str, metrics: &MetricsTracker) -> io::Result<()> {
        writeln!(self.out, "{title}")?;
        for (name, value) in metrics.iter() {
            writeln!(self.out, "  {name:<24} {value:>12.6}")?;
        }
        Ok(())
    }
}

impl<W: Write> MetricsSink for ConsoleSink<W> {
    fn name(&self) -> &str {
        "console"
    }

    fn log_train(&mut self, record: &CheckpointRecord) -> Result<()> {
        self.print_iter(record)?;
        for trainer in record.trainers() {
            self.print_lr(trainer)?;
        }
        writeln!(self.out, "{TRAIN_BANNER}")?;
        for trainer in record.trainers() {
            self.print_metrics(&trainer.model_name, &trainer.metrics)?;
        }
        Ok(())
    }

    fn log_eval(&mut self, iteration: usize, results: &MetricsTracker) -> Result<()> {
        writeln!(self.out, "{TEST_BANNER}")?;
        self.print_metrics(&format!("iteration {iteration}"), results)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CheckpointRecord {
        CheckpointRecord {
            iteration: 100,
            epoch_idx: 0,
            num_epoch: 3,
            iter_idx: 99,
            len_dataloader: 500,
            elapsed_secs: 1.5,
            lr: Some(2e-4),
            core: Some(TrainerSummary {
                role: "core".into(),
                model_name: "cooperative-core".into(),
                learning_rates: vec![2e-4, 1e-4],
                metrics: MetricsTracker::new().with("prediction_loss", 0.25),
            }),
            encoder: None,
        }
    }

    #[test]
    fn test_train_block() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.log_train(&record()).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.starts_with("[Epoch 1/3][Iter 100/500] Time: 1.50 sec\n"));
        assert!(text.contains("LR (core): 2.000e-4 | 1.000e-4"));
        assert!(text.contains(TRAIN_BANNER));
        assert!(text.contains("cooperative-core\n  prediction_loss"));
    }

    #[test]
    fn test_eval_block() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.log_eval(100, &MetricsTracker::new().with("accuracy", 0.9))
            .unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert!(text.contains(TEST_BANNER));
        assert!(text.contains("accuracy"));
    }
}
