//! CLI subcommand handlers.

use crate::Commands;
use anyhow::Context;
use beauty_core::data::{CsvSource, InMemoryDataSource, Sample, synthetic_regression, tensor_batch};
use beauty_core::nn::{LinearRegressor, Model, MseLoss, StateDict, Tensor};
use beauty_core::training::{
    CheckpointStore, MetricBundle, ResumeMode, Runner, TracingReporter, TrainingHistory,
    TrainingLoop,
};
use beauty_core::{ConfigOverrides, TrainingConfig, load_config};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Train {
            config,
            resume,
            fresh,
            epochs,
            checkpoint_dir,
        } => {
            let overrides = ConfigOverrides {
                epochs,
                checkpoint_dir,
            };
            let config = load_config(config.as_deref(), &overrides)
                .context("failed to load configuration")?;
            let resume = resume.map(|path| {
                let mode = if fresh {
                    ResumeMode::Fresh
                } else {
                    ResumeMode::Continue
                };
                (path, mode)
            });
            let history = run_train(&config, resume)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        Commands::Evaluate { checkpoint, config } => {
            let config = load_config(config.as_deref(), &ConfigOverrides::default())
                .context("failed to load configuration")?;
            let averages = run_evaluate(&config, &checkpoint)?;
            println!("{}", serde_json::to_string_pretty(&averages)?);
            Ok(())
        }
        Commands::Inspect { checkpoint } => {
            println!("{}", serde_json::to_string_pretty(&inspect(&checkpoint)?)?);
            Ok(())
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref(), &ConfigOverrides::default())
                .context("failed to load configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Train and validation sources described by the `data` section.
fn datasets(config: &TrainingConfig) -> anyhow::Result<(InMemoryDataSource, InMemoryDataSource)> {
    let d = &config.data;
    let (train, val): (Vec<Sample>, Vec<Sample>) = match (&d.train_csv, &d.val_csv) {
        (Some(train), Some(val)) => (
            CsvSource::new(train).load()?,
            CsvSource::new(val).load()?,
        ),
        _ => {
            let mut samples =
                synthetic_regression(d.train_samples + d.val_samples, d.features, d.noise, d.seed);
            let val = samples.split_off(d.train_samples);
            (samples, val)
        }
    };
    if train.is_empty() || val.is_empty() {
        anyhow::bail!("training and validation sets must both be non-empty");
    }

    let batch_size = config.training.batch_size;
    let mut train = InMemoryDataSource::new(train, batch_size)?;
    if d.shuffle {
        train = train.with_shuffle(d.seed);
    }
    Ok((train, InMemoryDataSource::new(val, batch_size)?))
}

fn metrics(config: &TrainingConfig) -> anyhow::Result<Arc<MetricBundle<Tensor, Tensor>>> {
    Ok(Arc::new(MetricBundle::regression(&config.training.metrics)?))
}

/// Shape of the regressor stored in a state dict: `(inputs, outputs)`.
fn regressor_shape(state: &StateDict) -> anyhow::Result<(usize, usize)> {
    let weight = state
        .get("linear.weight")
        .context("checkpoint has no 'linear.weight' parameter")?;
    match weight.shape() {
        [outputs, inputs] => Ok((*inputs, *outputs)),
        other => anyhow::bail!("unexpected weight shape {other:?}"),
    }
}

pub(crate) fn run_train(
    config: &TrainingConfig,
    resume: Option<(PathBuf, ResumeMode)>,
) -> anyhow::Result<TrainingHistory> {
    let (mut train, mut val) = datasets(config)?;
    let first = &train.samples()[0];
    let model = LinearRegressor::seeded(first.features.len(), first.target.len(), config.data.seed);

    let loss = Arc::new(MseLoss);
    let metrics = metrics(config)?;
    let trainer = Runner::trainer(
        loss.clone(),
        metrics.clone(),
        Box::new(config.build_optimizer()),
        Box::new(config.build_scheduler()),
    )
    .with_reporter(Box::new(TracingReporter::new(config.training.log_every)));
    let evaluator = Runner::evaluator(loss, metrics)
        .with_reporter(Box::new(TracingReporter::new(config.training.log_every)));

    let mut training = TrainingLoop::new(
        model,
        trainer,
        evaluator,
        CheckpointStore::new(&config.checkpoint.dir),
        config.loop_options(),
    )?;
    if let Some((path, mode)) = resume {
        training
            .resume(&path, mode)
            .with_context(|| format!("cannot resume from {}", path.display()))?;
    }

    tracing::info!(
        epochs = config.training.epochs,
        start_epoch = training.start_epoch(),
        checkpoint_dir = %config.checkpoint.dir.display(),
        "training started"
    );
    let history = training.train(&mut train, &mut val, &tensor_batch)?;
    tracing::info!(
        epochs_run = history.len(),
        stopped_early = history.stopped_early,
        best = %training.best(),
        "training finished"
    );
    Ok(history)
}

pub(crate) fn run_evaluate(
    config: &TrainingConfig,
    checkpoint: &Path,
) -> anyhow::Result<BTreeMap<String, f64>> {
    let record = CheckpointStore::load(checkpoint)?;
    let (inputs, outputs) = regressor_shape(&record.state_dict)?;
    let mut model = LinearRegressor::new(inputs, outputs);
    model.load_state_dict(&record.state_dict)?;

    let (_, mut val) = datasets(config)?;
    let mut evaluator = Runner::evaluator(Arc::new(MseLoss), metrics(config)?)
        .with_reporter(Box::new(TracingReporter::new(config.training.log_every)));
    let meters = evaluator.run(&mut model, &mut val, &tensor_batch, record.epoch)?;

    let mut averages = meters.averages();
    averages.insert("loss".to_string(), evaluator.meters().loss.average());
    Ok(averages)
}

pub(crate) fn inspect(checkpoint: &Path) -> anyhow::Result<serde_json::Value> {
    let record = CheckpointStore::load(checkpoint)?;
    let parameters: BTreeMap<&str, &[usize]> = record
        .state_dict
        .iter()
        .map(|(name, tensor)| (name.as_str(), tensor.shape()))
        .collect();
    Ok(serde_json::json!({
        "epoch": record.epoch,
        "best_meters": record.best_meters,
        "parameters": parameters,
        "scheduler": record.scheduler.is_some(),
    }))
}
