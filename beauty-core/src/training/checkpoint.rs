//! Checkpoint persistence and best-metric bookkeeping.
//!
//! A checkpoint directory holds:
//! - `checkpoint.json`: the latest epoch,
//! - `model_best.json`: published when the caller flags the save as best,
//! - `model_best_<metric>.json`: one per metric whose best value improved.
//!
//! Every file is published atomically (staging file + rename). Files are
//! JSON envelopes carrying a SHA-256 checksum of the record.

use crate::error::{Result, TrainError};
use crate::nn::model::StateDict;
use crate::persistence;
use crate::training::meters::{BestMeters, MetricMeters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Envelope format understood by [`CheckpointStore::load`].
pub const FORMAT_VERSION: u32 = 1;

const LATEST_FILE: &str = "checkpoint.json";
const BEST_FILE: &str = "model_best.json";

/// Everything needed to resume training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Index of the next epoch to run.
    pub epoch: usize,
    pub state_dict: StateDict,
    pub optimizer: serde_json::Value,
    #[serde(default)]
    pub scheduler: Option<serde_json::Value>,
    /// Best value seen so far per metric name.
    pub best_meters: BTreeMap<String, f64>,
}

impl Checkpoint {
    fn ensure_finite(&self) -> Result<()> {
        if let Some((name, _)) = self.state_dict.iter().find(|(_, t)| !t.is_finite()) {
            return Err(TrainError::invalid_argument(format!(
                "parameter '{name}' holds non-finite values"
            )));
        }
        if let Some((name, _)) = self.best_meters.iter().find(|(_, v)| !v.is_finite()) {
            return Err(TrainError::invalid_argument(format!(
                "best value of '{name}' is not finite"
            )));
        }
        Ok(())
    }

    fn checksum(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    id: String,
    saved_at: DateTime<Utc>,
    checksum: String,
    record: &'a Checkpoint,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    checksum: String,
    record: Checkpoint,
}

/// Durable checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST_FILE)
    }

    /// Path of the best checkpoint for one metric.
    pub fn metric_best_path(&self, metric: &str) -> PathBuf {
        let safe: String = metric
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("model_best_{safe}.json"))
    }

    /// Publish `record` as the latest checkpoint, and as `model_best.json`
    /// when `is_best`. Returns the latest path.
    pub fn save(&self, record: &Checkpoint, is_best: bool) -> Result<PathBuf> {
        self.save_with_best(record, is_best, &BTreeSet::new())
    }

    /// Like [`save`](Self::save), also publishing a per-metric best copy for
    /// every name in `improved`.
    pub fn save_with_best(
        &self,
        record: &Checkpoint,
        is_best: bool,
        improved: &BTreeSet<String>,
    ) -> Result<PathBuf> {
        record.ensure_finite()?;
        let envelope = EnvelopeRef {
            format_version: FORMAT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            saved_at: Utc::now(),
            checksum: record.checksum()?,
            record,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let latest = self.latest_path();
        persistence::atomic_write(&latest, &bytes)?;
        if is_best {
            persistence::atomic_write(&self.best_path(), &bytes)?;
        }
        for metric in improved {
            persistence::atomic_write(&self.metric_best_path(metric), &bytes)?;
        }
        tracing::debug!(
            path = %latest.display(),
            epoch = record.epoch,
            is_best,
            improved = improved.len(),
            "checkpoint saved"
        );
        Ok(latest)
    }

    /// Load and verify a checkpoint file.
    pub fn load(path: &Path) -> Result<Checkpoint> {
        if !path.exists() {
            return Err(TrainError::not_found(format!(
                "checkpoint {}",
                path.display()
            )));
        }
        let bytes = std::fs::read(path)?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| TrainError::corrupt(format!("{}: {e}", path.display())))?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(TrainError::corrupt(format!(
                "{}: unsupported format version {}",
                path.display(),
                envelope.format_version
            )));
        }
        if envelope.record.checksum()? != envelope.checksum {
            return Err(TrainError::corrupt(format!(
                "{}: checksum mismatch",
                path.display()
            )));
        }
        Ok(envelope.record)
    }

    pub fn load_latest(&self) -> Result<Checkpoint> {
        Self::load(&self.latest_path())
    }
}

/// Outcome of comparing one evaluation round against the best so far.
#[derive(Debug, Clone, PartialEq)]
pub struct BestUpdate {
    /// Metrics whose best value improved this round.
    pub improved: BTreeSet<String>,
    /// Best-so-far values including this round.
    pub best: BestMeters,
}

impl BestUpdate {
    pub fn improved(&self, metric: &str) -> bool {
        self.improved.contains(metric)
    }

    pub fn any_improved(&self) -> bool {
        !self.improved.is_empty()
    }
}

/// Compare `current` against `previous`, metric by metric.
///
/// No combined ranking is applied: each metric improves or not on its own
/// polarity.
pub fn is_best(current: &MetricMeters, previous: &BestMeters) -> Result<BestUpdate> {
    let mut best = previous.clone();
    let improved = best.update(current)?;
    Ok(BestUpdate { improved, best })
}
