//! # beauty-core: epoch-execution engine for supervised training
//!
//! The crate runs the inner loop of supervised model training:
//!
//! - [`training::Runner`] iterates one epoch of batches as a trainer
//!   (forward, loss, backward, optimizer and schedule step) or an evaluator
//!   (forward and loss only), timing every batch against an injected
//!   [`clock::Clock`] and accumulating weighted running averages.
//! - [`training::BestMeters`] tracks the best value of every metric across
//!   evaluation rounds, independently per metric.
//! - [`training::CheckpointStore`] publishes checksummed checkpoints
//!   atomically and loads them back.
//! - [`training::TrainingLoop`] alternates training and validation epochs,
//!   checkpoints after each one and resumes from a stored checkpoint.
//!
//! Models, losses, metrics, optimizers, schedules and data sources are
//! traits; [`nn`] and [`data`] ship small reference implementations.

pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod nn;
pub mod persistence;
pub mod training;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigOverrides, TrainingConfig, load_config};
pub use error::{Result, TrainError};
pub use training::{
    CheckpointStore, LoopOptions, MetricBundle, ResumeMode, Runner, StatMeter, TrainingHistory,
    TrainingLoop,
};
