//! Training engine: meters, metrics, runners, checkpoints and the epoch loop.

pub mod callbacks;
pub mod checkpoint;
pub mod meters;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod runner;

pub use callbacks::{CallbackAction, EarlyStopping};
pub use checkpoint::{BestUpdate, Checkpoint, CheckpointStore, is_best};
pub use meters::{BestMeters, MetricMeters, StatMeter};
pub use metrics::{Metric, MetricBundle, Polarity};
pub use orchestrator::{EpochSummary, LoopOptions, ResumeMode, TrainingHistory, TrainingLoop};
pub use progress::{BatchReport, EpochReport, ProgressReporter, RecordingReporter, TracingReporter};
pub use runner::{Phase, Runner, RunnerMeters, Variant};
