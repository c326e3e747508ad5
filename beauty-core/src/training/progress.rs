//! Per-batch and per-epoch progress reports.

use crate::training::runner::Phase;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Running statistics after one batch. Times are seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub phase: Phase,
    pub epoch: usize,
    /// 1-based index of the batch just processed.
    pub batch: usize,
    pub total: usize,
    pub batch_time: f64,
    pub data_time: f64,
    pub loss: f64,
    pub metrics: BTreeMap<String, f64>,
}

/// Final running statistics of one `run()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochReport {
    pub phase: Phase,
    pub epoch: usize,
    pub batches: usize,
    pub batch_time: f64,
    pub data_time: f64,
    pub loss: f64,
    pub metrics: BTreeMap<String, f64>,
    pub elapsed: f64,
}

fn write_metrics(f: &mut fmt::Formatter<'_>, metrics: &BTreeMap<String, f64>) -> fmt::Result {
    for (name, value) in metrics {
        write!(f, "\t{name} {value:.4}")?;
    }
    Ok(())
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} epoch {}: {}/{}\tTime {:.3}\tData {:.3}\tLoss {:.4}",
            self.phase.tag(),
            self.epoch,
            self.batch,
            self.total,
            self.batch_time,
            self.data_time,
            self.loss
        )?;
        write_metrics(f, &self.metrics)
    }
}

impl fmt::Display for EpochReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} epoch {} done in {:.2}s ({} batches)\tTime {:.3}\tData {:.3}\tLoss {:.4}",
            self.phase.tag(),
            self.epoch,
            self.elapsed,
            self.batches,
            self.batch_time,
            self.data_time,
            self.loss
        )?;
        write_metrics(f, &self.metrics)
    }
}

/// Sink for runner progress.
pub trait ProgressReporter: Send {
    fn on_batch(&mut self, report: &BatchReport);

    fn on_epoch(&mut self, report: &EpochReport);
}

/// Emits progress as `tracing` events.
///
/// Batch events are emitted every `log_every` batches and always for the
/// last batch of an epoch.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    log_every: usize,
}

impl TracingReporter {
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl Default for TracingReporter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ProgressReporter for TracingReporter {
    fn on_batch(&mut self, report: &BatchReport) {
        if report.batch % self.log_every != 0 && report.batch != report.total {
            return;
        }
        tracing::info!(
            phase = report.phase.tag(),
            epoch = report.epoch,
            batch = report.batch,
            total = report.total,
            batch_time = report.batch_time,
            data_time = report.data_time,
            loss = report.loss,
            "{report}"
        );
    }

    fn on_epoch(&mut self, report: &EpochReport) {
        tracing::info!(
            phase = report.phase.tag(),
            epoch = report.epoch,
            batches = report.batches,
            loss = report.loss,
            elapsed = report.elapsed,
            "{report}"
        );
    }
}

/// Keeps every report in memory; clones share the same buffers.
#[derive(Debug, Clone, Default)]
pub struct RecordingReporter {
    batches: Arc<Mutex<Vec<BatchReport>>>,
    epochs: Arc<Mutex<Vec<EpochReport>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<BatchReport> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    pub fn epochs(&self) -> Vec<EpochReport> {
        self.epochs.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_batch(&mut self, report: &BatchReport) {
        if let Ok(mut batches) = self.batches.lock() {
            batches.push(report.clone());
        }
    }

    fn on_epoch(&mut self, report: &EpochReport) {
        if let Ok(mut epochs) = self.epochs.lock() {
            epochs.push(report.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report_line_has_every_field() {
        let report = BatchReport {
            phase: Phase::Train,
            epoch: 2,
            batch: 3,
            total: 10,
            batch_time: 0.25,
            data_time: 0.05,
            loss: 1.5,
            metrics: BTreeMap::from([("mae".to_string(), 0.75)]),
        };
        assert_eq!(
            report.to_string(),
            "Training epoch 2: 3/10\tTime 0.250\tData 0.050\tLoss 1.5000\tmae 0.7500"
        );
    }

    #[test]
    fn test_recording_reporter_shares_buffers() {
        let recorder = RecordingReporter::new();
        let mut handle = recorder.clone();
        handle.on_epoch(&EpochReport {
            phase: Phase::Eval,
            epoch: 0,
            batches: 1,
            batch_time: 0.0,
            data_time: 0.0,
            loss: 0.0,
            metrics: BTreeMap::new(),
            elapsed: 0.0,
        });
        assert_eq!(recorder.epochs().len(), 1);
    }
}
