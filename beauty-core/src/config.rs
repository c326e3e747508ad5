//! Training configuration.
//!
//! Layers, lowest precedence first: built-in defaults, an optional TOML file,
//! `BEAUTY_`-prefixed environment variables (`__` separates sections, e.g.
//! `BEAUTY_OPTIMIZER__LEARNING_RATE=0.05`), then explicit overrides.

use crate::error::{Result, TrainError};
use crate::nn::{LrPolicy, LrScheduler, Sgd};
use crate::training::orchestrator::LoopOptions;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BEAUTY_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub training: TrainingSection,
    #[serde(default)]
    pub optimizer: OptimizerSection,
    #[serde(default)]
    pub schedule: LrPolicy,
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Log every n-th batch; the default logs each one. The last batch of an
    /// epoch is always logged.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    /// Metric whose improvement publishes `model_best.json`.
    #[serde(default)]
    pub monitor: Option<String>,
    #[serde(default)]
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            log_every: default_log_every(),
            metrics: default_metrics(),
            monitor: None,
            early_stopping_patience: None,
        }
    }
}

fn default_epochs() -> usize {
    10
}

fn default_batch_size() -> usize {
    32
}

fn default_log_every() -> usize {
    1
}

fn default_metrics() -> Vec<String> {
    vec!["mae".into(), "rmse".into(), "pearson".into()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSection {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub weight_decay: f64,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

fn default_learning_rate() -> f64 {
    0.01
}

/// Where samples come from. CSV paths win over the synthetic generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSection {
    #[serde(default)]
    pub train_csv: Option<PathBuf>,
    #[serde(default)]
    pub val_csv: Option<PathBuf>,
    #[serde(default = "default_train_samples")]
    pub train_samples: usize,
    #[serde(default = "default_val_samples")]
    pub val_samples: usize,
    #[serde(default = "default_features")]
    pub features: usize,
    #[serde(default = "default_noise")]
    pub noise: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            train_csv: None,
            val_csv: None,
            train_samples: default_train_samples(),
            val_samples: default_val_samples(),
            features: default_features(),
            noise: default_noise(),
            seed: default_seed(),
            shuffle: true,
        }
    }
}

fn default_train_samples() -> usize {
    512
}

fn default_val_samples() -> usize {
    128
}

fn default_features() -> usize {
    8
}

fn default_noise() -> f64 {
    0.1
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

/// Values set on the command line; they beat every other layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub epochs: Option<usize>,
    pub checkpoint_dir: Option<PathBuf>,
}

impl TrainingConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        if t.epochs == 0 {
            return Err(TrainError::config("training.epochs must be > 0"));
        }
        if t.batch_size == 0 {
            return Err(TrainError::config("training.batch_size must be > 0"));
        }
        if t.metrics.is_empty() {
            return Err(TrainError::config("training.metrics must not be empty"));
        }
        if let Some(monitor) = &t.monitor {
            if !t.metrics.contains(monitor) {
                return Err(TrainError::config(format!(
                    "training.monitor '{monitor}' is not listed in training.metrics"
                )));
            }
        }
        match (t.early_stopping_patience, &t.monitor) {
            (Some(0), _) => {
                return Err(TrainError::config(
                    "training.early_stopping_patience must be > 0",
                ));
            }
            (Some(_), None) => {
                return Err(TrainError::config(
                    "training.early_stopping_patience requires training.monitor",
                ));
            }
            _ => {}
        }

        let o = &self.optimizer;
        if !(o.learning_rate.is_finite() && o.learning_rate > 0.0) {
            return Err(TrainError::config(format!(
                "optimizer.learning_rate must be positive, got {}",
                o.learning_rate
            )));
        }
        if o.momentum < 0.0 || o.weight_decay < 0.0 {
            return Err(TrainError::config(
                "optimizer.momentum and optimizer.weight_decay must be >= 0",
            ));
        }

        match self.schedule {
            LrPolicy::Step { step_size: 0, .. } => {
                return Err(TrainError::config("schedule.step_size must be > 0"));
            }
            LrPolicy::Step { gamma, .. } | LrPolicy::Exponential { gamma } if gamma <= 0.0 => {
                return Err(TrainError::config("schedule.gamma must be > 0"));
            }
            LrPolicy::Cosine { total_steps: 0, .. } => {
                return Err(TrainError::config("schedule.total_steps must be > 0"));
            }
            _ => {}
        }

        let d = &self.data;
        if d.features == 0 {
            return Err(TrainError::config("data.features must be > 0"));
        }
        if d.train_csv.is_none() && (d.train_samples == 0 || d.val_samples == 0) {
            return Err(TrainError::config(
                "data.train_samples and data.val_samples must be > 0",
            ));
        }
        if d.train_csv.is_some() != d.val_csv.is_some() {
            return Err(TrainError::config(
                "data.train_csv and data.val_csv must be set together",
            ));
        }
        Ok(())
    }

    pub fn build_optimizer(&self) -> Sgd {
        Sgd::new(self.optimizer.learning_rate)
            .with_momentum(self.optimizer.momentum)
            .with_weight_decay(self.optimizer.weight_decay)
    }

    pub fn build_scheduler(&self) -> LrScheduler {
        LrScheduler::new(self.schedule.clone(), self.optimizer.learning_rate)
    }

    pub fn loop_options(&self) -> LoopOptions {
        LoopOptions {
            epochs: self.training.epochs,
            monitor: self.training.monitor.clone(),
            patience: self.training.early_stopping_patience,
        }
    }
}

/// Load and validate the layered configuration.
///
/// An explicitly named file that does not exist is an error.
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<TrainingConfig> {
    let mut figment = Figment::from(Serialized::defaults(TrainingConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(TrainError::not_found(format!(
                "config file {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    if let Some(epochs) = overrides.epochs {
        figment = figment.merge(Serialized::default("training.epochs", epochs));
    }
    if let Some(dir) = &overrides.checkpoint_dir {
        figment = figment.merge(Serialized::default("checkpoint.dir", dir));
    }

    let config: TrainingConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrainingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.training.metrics, vec!["mae", "rmse", "pearson"]);
        assert_eq!(config.schedule, LrPolicy::Constant);
        assert_eq!(config.training.log_every, 1);
    }

    #[test]
    fn test_load_config_from_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beauty.toml");
        std::fs::write(
            &path,
            r#"
[training]
epochs = 4
batch_size = 16
monitor = "pearson"
early_stopping_patience = 3

[optimizer]
learning_rate = 0.05
momentum = 0.9

[schedule]
kind = "step"
step_size = 100
gamma = 0.5

[checkpoint]
dir = "runs/a"
"#,
        )
        .unwrap();

        let overrides = ConfigOverrides {
            epochs: Some(7),
            checkpoint_dir: None,
        };
        let config = load_config(Some(&path), &overrides).unwrap();
        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.batch_size, 16);
        assert_eq!(config.training.monitor.as_deref(), Some("pearson"));
        assert_eq!(config.optimizer.momentum, 0.9);
        assert_eq!(
            config.schedule,
            LrPolicy::Step {
                step_size: 100,
                gamma: 0.5
            }
        );
        assert_eq!(config.checkpoint.dir, PathBuf::from("runs/a"));
        assert_eq!(config.loop_options().patience, Some(3));
    }

    #[test]
    fn test_missing_config_file_is_not_found() {
        let err = load_config(
            Some(Path::new("/nonexistent/beauty.toml")),
            &ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::NotFound(_)));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beauty.toml");
        std::fs::write(&path, "[training]\nepochs = \"many\"\n").unwrap();
        let err = load_config(Some(&path), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, TrainError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TrainingConfig::default();
        config.training.epochs = 0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.optimizer.learning_rate = 0.0;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.training.monitor = Some("accuracy".into());
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.training.early_stopping_patience = Some(2);
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.schedule = LrPolicy::Exponential { gamma: 0.0 };
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));
    }

    #[test]
    fn test_builders_follow_config() {
        let mut config = TrainingConfig::default();
        config.optimizer.learning_rate = 0.2;
        config.schedule = LrPolicy::Exponential { gamma: 0.5 };
        let scheduler = config.build_scheduler();
        assert_eq!(scheduler.rate_at(1), 0.1);
        assert_eq!(config.build_optimizer(), Sgd::new(0.2));
    }
}
