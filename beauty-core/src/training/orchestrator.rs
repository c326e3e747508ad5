//! The epoch loop: train, evaluate, track best metrics, checkpoint.

use crate::clock::{Clock, SystemClock};
use crate::data::{DataSource, ParseBatch};
use crate::error::{Result, TrainError};
use crate::nn::model::Model;
use crate::training::callbacks::{CallbackAction, EarlyStopping};
use crate::training::checkpoint::{Checkpoint, CheckpointStore, is_best};
use crate::training::meters::BestMeters;
use crate::training::runner::{Phase, Runner};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// How much of a checkpoint [`TrainingLoop::resume`] restores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Model, optimizer, scheduler and best meters; training continues at
    /// the stored epoch.
    #[default]
    Continue,
    /// Model weights only; training restarts at epoch 0.
    Fresh,
}

/// Loop-level settings.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LoopOptions {
    /// Total number of epochs, counting those already done before a resume.
    pub epochs: usize,
    /// Metric whose improvement publishes `model_best.json`.
    pub monitor: Option<String>,
    /// Stop after this many epochs without improvement of `monitor`.
    pub patience: Option<usize>,
}

impl LoopOptions {
    pub fn new(epochs: usize) -> Self {
        Self {
            epochs,
            ..Self::default()
        }
    }

    pub fn with_monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = Some(metric.into());
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = Some(patience);
        self
    }
}

/// Outcome of one executed epoch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    /// Validation metric averages.
    pub metrics: BTreeMap<String, f64>,
    /// Metrics whose best value improved this epoch.
    pub improved: BTreeSet<String>,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochSummary>,
    pub stopped_early: bool,
    /// Best value per metric when the loop returned.
    pub best: BTreeMap<String, f64>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochSummary> {
        self.epochs.last()
    }
}

/// Drives a trainer and an evaluator over one model for a number of epochs.
///
/// The loop owns the model and lends it to one runner at a time.
pub struct TrainingLoop<M: Model, T> {
    model: M,
    trainer: Runner<M::Output, T>,
    evaluator: Runner<M::Output, T>,
    best: BestMeters,
    store: CheckpointStore,
    options: LoopOptions,
    stopper: Option<EarlyStopping>,
    start_epoch: usize,
    clock: Arc<dyn Clock>,
}

impl<M: Model, T> TrainingLoop<M, T> {
    pub fn new(
        model: M,
        trainer: Runner<M::Output, T>,
        evaluator: Runner<M::Output, T>,
        store: CheckpointStore,
        options: LoopOptions,
    ) -> Result<Self> {
        if trainer.phase() != Phase::Train {
            return Err(TrainError::invalid_argument(
                "the training runner must be a trainer",
            ));
        }
        if evaluator.phase() != Phase::Eval {
            return Err(TrainError::invalid_argument(
                "the validation runner must be an evaluator",
            ));
        }
        let best = evaluator.metrics().create_best_meters();
        if let Some(monitor) = &options.monitor {
            if !best.contains(monitor) {
                return Err(TrainError::invalid_argument(format!(
                    "monitored metric '{monitor}' is not computed by the evaluator"
                )));
            }
        }
        let stopper = match (options.patience, &options.monitor) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(TrainError::invalid_argument(
                    "early stopping needs a monitored metric",
                ));
            }
            (Some(0), Some(_)) => {
                return Err(TrainError::invalid_argument("patience must be at least 1"));
            }
            (Some(patience), Some(_)) => Some(EarlyStopping::new(patience)),
        };

        Ok(Self {
            model,
            trainer,
            evaluator,
            best,
            store,
            options,
            stopper,
            start_epoch: 0,
            clock: Arc::new(SystemClock::new()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn trainer(&self) -> &Runner<M::Output, T> {
        &self.trainer
    }

    pub fn evaluator(&self) -> &Runner<M::Output, T> {
        &self.evaluator
    }

    pub fn best(&self) -> &BestMeters {
        &self.best
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// First epoch the next `train()` call will run.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Restore state from the checkpoint at `path`; returns the new start
    /// epoch.
    ///
    /// All or nothing: if any part of the record is rejected, the model,
    /// optimizer, scheduler, best meters and start epoch keep their values.
    pub fn resume(&mut self, path: &Path, mode: ResumeMode) -> Result<usize> {
        let record = CheckpointStore::load(path)?;
        let mut best = self.best.clone();
        if mode == ResumeMode::Continue {
            best.restore(&record.best_meters)?;
        }

        let previous = self.snapshot(self.start_epoch)?;
        if let Err(err) = self.load_record(&record, mode) {
            if let Err(rollback) = self.load_record(&previous, ResumeMode::Continue) {
                tracing::warn!(error = %rollback, "could not roll back a failed resume");
            }
            return Err(err);
        }

        match mode {
            ResumeMode::Fresh => self.start_epoch = 0,
            ResumeMode::Continue => {
                self.best = best;
                self.start_epoch = record.epoch;
            }
        }
        if let Some(stopper) = &mut self.stopper {
            stopper.reset();
        }

        tracing::info!(
            path = %path.display(),
            mode = ?mode,
            start_epoch = self.start_epoch,
            best = %self.best,
            "resumed from checkpoint"
        );
        Ok(self.start_epoch)
    }

    /// Load the weights, plus optimizer and scheduler state for `Continue`.
    fn load_record(&mut self, record: &Checkpoint, mode: ResumeMode) -> Result<()> {
        self.model.load_state_dict(&record.state_dict)?;
        if mode == ResumeMode::Fresh {
            return Ok(());
        }
        let optimizer = self
            .trainer
            .optimizer_mut()
            .ok_or_else(|| TrainError::invalid_argument("trainer has no optimizer"))?;
        optimizer.load_state_dict(&record.optimizer)?;
        if let (Some(state), Some(scheduler)) = (&record.scheduler, self.trainer.scheduler_mut()) {
            scheduler.load_state_dict(state)?;
        }
        Ok(())
    }

    /// Run epochs `start_epoch..epochs`. Any error aborts the loop; the last
    /// completed epoch's checkpoint stays on disk.
    pub fn train<DT, DV, P>(
        &mut self,
        train_data: &mut DT,
        val_data: &mut DV,
        parser: &P,
    ) -> Result<TrainingHistory>
    where
        DT: DataSource,
        DV: DataSource<Item = DT::Item>,
        P: ParseBatch<DT::Item, M::Input, T>,
    {
        let mut history = TrainingHistory::default();
        if self.start_epoch >= self.options.epochs {
            tracing::info!(
                start_epoch = self.start_epoch,
                epochs = self.options.epochs,
                "nothing to train"
            );
        }

        for epoch in self.start_epoch..self.options.epochs {
            let begun = self.clock.now();

            self.trainer
                .run(&mut self.model, train_data, parser, epoch)?;
            let train_loss = self.trainer.meters().loss.average();

            let current = self
                .evaluator
                .run(&mut self.model, val_data, parser, epoch)?;
            let val_loss = self.evaluator.meters().loss.average();

            let update = is_best(&current, &self.best)?;
            let monitored = self
                .options
                .monitor
                .as_deref()
                .is_some_and(|m| update.improved(m));
            self.best = update.best;

            let record = self.snapshot(epoch + 1)?;
            self.store
                .save_with_best(&record, monitored, &update.improved)?;
            self.start_epoch = epoch + 1;

            let duration = self.clock.now().saturating_sub(begun).as_secs_f64();
            tracing::info!(
                epoch,
                train_loss,
                val_loss,
                improved = update.improved.len(),
                best = %self.best,
                "epoch {epoch} complete in {duration:.2}s"
            );
            history.epochs.push(EpochSummary {
                epoch,
                train_loss,
                val_loss,
                metrics: current.averages(),
                improved: update.improved,
                duration,
            });

            if let Some(stopper) = &mut self.stopper {
                if stopper.on_epoch_end(monitored) == CallbackAction::Stop {
                    tracing::info!(
                        epoch,
                        patience = stopper.patience(),
                        "early stopping: no improvement"
                    );
                    history.stopped_early = true;
                    break;
                }
            }
        }

        history.best = self.best.snapshot();
        Ok(history)
    }

    /// Checkpoint record resuming at `next_epoch`.
    fn snapshot(&self, next_epoch: usize) -> Result<Checkpoint> {
        let optimizer = self
            .trainer
            .optimizer()
            .ok_or_else(|| TrainError::invalid_argument("trainer has no optimizer"))?
            .state_dict()?;
        let scheduler = self
            .trainer
            .scheduler()
            .map(|s| s.state_dict())
            .transpose()?;
        Ok(Checkpoint {
            epoch: next_epoch,
            state_dict: self.model.state_dict(),
            optimizer,
            scheduler,
            best_meters: self.best.snapshot(),
        })
    }
}
