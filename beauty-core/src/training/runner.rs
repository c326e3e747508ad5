//! Epoch runners: the batch-iteration protocol shared by training and
//! evaluation.
//!
//! A [`Runner`] is one of a closed set of variants ([`Variant::Trainer`] or
//! [`Variant::Evaluator`]) chosen at construction. Every `run()`:
//!
//! 1. puts the model in the variant's mode,
//! 2. resets the runner's meters,
//! 3. calls the per-epoch hook,
//! 4. for each batch in order: measures data wait, parses the batch, runs
//!    forward / loss / metrics on one output, applies the variant's update
//!    step, measures batch time, updates meters and reports progress,
//! 5. returns the per-metric running averages.
//!
//! Errors are never swallowed: the first failing batch aborts the epoch.
//!
//! A runner is single-owner. Its meters are reset on entry, so it must not be
//! shared between concurrent `run()` calls; the `&mut self` receiver enforces
//! that within one process. The model is borrowed mutably for the whole run,
//! so a trainer and an evaluator can never drive the same model at once.

use crate::clock::{Clock, SystemClock};
use crate::data::{Batch, DataSource, ParseBatch};
use crate::error::{Result, TrainError};
use crate::nn::loss::Loss;
use crate::nn::model::{Mode, Model};
use crate::nn::optim::Optimizer;
use crate::nn::schedule::Scheduler;
use crate::training::meters::{MetricMeters, StatMeter};
use crate::training::metrics::MetricBundle;
use crate::training::progress::{BatchReport, EpochReport, ProgressReporter, TracingReporter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Which side of an epoch a runner executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Eval,
}

impl Phase {
    /// Tag used in progress lines.
    pub fn tag(self) -> &'static str {
        match self {
            Phase::Train => "Training",
            Phase::Eval => "Validation",
        }
    }

    pub fn mode(self) -> Mode {
        match self {
            Phase::Train => Mode::Train,
            Phase::Eval => Mode::Eval,
        }
    }
}

/// Variant-specific state and update step.
pub enum Variant {
    /// Clears gradients, backpropagates, steps the optimizer and then the
    /// schedule, once per batch.
    Trainer {
        optimizer: Box<dyn Optimizer>,
        scheduler: Box<dyn Scheduler>,
    },
    /// Inference only; the update step is a no-op.
    Evaluator,
}

impl Variant {
    pub fn phase(&self) -> Phase {
        match self {
            Variant::Trainer { .. } => Phase::Train,
            Variant::Evaluator => Phase::Eval,
        }
    }
}

/// Meters owned by a runner, reset at the start of every run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerMeters {
    /// Seconds per batch, data wait included.
    pub batch_time: StatMeter,
    /// Seconds spent waiting for the next batch.
    pub data_time: StatMeter,
    /// Loss, weighted by batch size.
    pub loss: StatMeter,
    pub metrics: MetricMeters,
}

impl RunnerMeters {
    fn reset(&mut self) {
        self.batch_time.reset();
        self.data_time.reset();
        self.loss.reset();
        self.metrics.reset();
    }
}

/// Epoch executor over model outputs `O` and targets `T`.
pub struct Runner<O, T> {
    variant: Variant,
    loss: Arc<dyn Loss<O, T>>,
    metrics: Arc<MetricBundle<O, T>>,
    meters: RunnerMeters,
    clock: Arc<dyn Clock>,
    reporter: Box<dyn ProgressReporter>,
}

impl<O, T> Runner<O, T> {
    pub fn new(
        variant: Variant,
        loss: Arc<dyn Loss<O, T>>,
        metrics: Arc<MetricBundle<O, T>>,
    ) -> Self {
        let meters = RunnerMeters {
            metrics: metrics.create_average_meters(),
            ..RunnerMeters::default()
        };
        Self {
            variant,
            loss,
            metrics,
            meters,
            clock: Arc::new(SystemClock::new()),
            reporter: Box::new(TracingReporter::default()),
        }
    }

    pub fn trainer(
        loss: Arc<dyn Loss<O, T>>,
        metrics: Arc<MetricBundle<O, T>>,
        optimizer: Box<dyn Optimizer>,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self::new(
            Variant::Trainer {
                optimizer,
                scheduler,
            },
            loss,
            metrics,
        )
    }

    pub fn evaluator(loss: Arc<dyn Loss<O, T>>, metrics: Arc<MetricBundle<O, T>>) -> Self {
        Self::new(Variant::Evaluator, loss, metrics)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn phase(&self) -> Phase {
        self.variant.phase()
    }

    pub fn metrics(&self) -> &MetricBundle<O, T> {
        &self.metrics
    }

    /// Meters of the most recent run.
    pub fn meters(&self) -> &RunnerMeters {
        &self.meters
    }

    pub fn optimizer(&self) -> Option<&dyn Optimizer> {
        match &self.variant {
            Variant::Trainer { optimizer, .. } => Some(optimizer.as_ref()),
            Variant::Evaluator => None,
        }
    }

    pub fn optimizer_mut(&mut self) -> Option<&mut dyn Optimizer> {
        match &mut self.variant {
            Variant::Trainer { optimizer, .. } => Some(&mut **optimizer),
            Variant::Evaluator => None,
        }
    }

    pub fn scheduler(&self) -> Option<&dyn Scheduler> {
        match &self.variant {
            Variant::Trainer { scheduler, .. } => Some(scheduler.as_ref()),
            Variant::Evaluator => None,
        }
    }

    pub fn scheduler_mut(&mut self) -> Option<&mut dyn Scheduler> {
        match &mut self.variant {
            Variant::Trainer { scheduler, .. } => Some(&mut **scheduler),
            Variant::Evaluator => None,
        }
    }

    /// Run one epoch over `data`, returning the per-metric running averages.
    pub fn run<M, D, P>(
        &mut self,
        model: &mut M,
        data: &mut D,
        parser: &P,
        epoch: usize,
    ) -> Result<MetricMeters>
    where
        M: Model<Output = O>,
        D: DataSource,
        P: ParseBatch<D::Item, M::Input, T>,
    {
        let phase = self.phase();
        model.set_mode(phase.mode());
        self.meters.reset();
        self.epoch_step(epoch);

        let total = data.len();
        let started = self.clock.now();
        let mut mark = started;
        let mut seen = 0;

        for (index, raw) in data.batches(epoch).enumerate() {
            if index >= total {
                return Err(TrainError::data_format(format!(
                    "data source yielded more than the {total} batches it announced"
                )));
            }
            let data_time = self.clock.now().saturating_sub(mark);

            let batch = parser.parse(raw)?;
            let loss = self.iterate(model, &batch, index)?;

            let batch_time = self.clock.now().saturating_sub(mark);
            self.update_stats(batch_time, data_time, loss, batch.size)?;
            self.reporter.on_batch(&BatchReport {
                phase,
                epoch,
                batch: index + 1,
                total,
                batch_time: self.meters.batch_time.average(),
                data_time: self.meters.data_time.average(),
                loss: self.meters.loss.average(),
                metrics: self.meters.metrics.averages(),
            });
            seen += 1;
            mark = self.clock.now();
        }

        if seen != total {
            return Err(TrainError::data_format(format!(
                "data source yielded {seen} batches, announced {total}"
            )));
        }

        let elapsed = self.clock.now().saturating_sub(started);
        self.reporter.on_epoch(&EpochReport {
            phase,
            epoch,
            batches: seen,
            batch_time: self.meters.batch_time.average(),
            data_time: self.meters.data_time.average(),
            loss: self.meters.loss.average(),
            metrics: self.meters.metrics.averages(),
            elapsed: elapsed.as_secs_f64(),
        });
        Ok(self.meters.metrics.clone())
    }

    /// Per-epoch hook, run after the meters are reset.
    fn epoch_step(&mut self, epoch: usize) {
        if let Variant::Trainer { optimizer, .. } = &self.variant {
            tracing::debug!(
                epoch,
                learning_rate = optimizer.learning_rate(),
                "starting training epoch"
            );
        }
    }

    /// Forward, loss, metrics and update step for one batch; returns the loss.
    fn iterate<M>(&mut self, model: &mut M, batch: &Batch<M::Input, T>, index: usize) -> Result<f64>
    where
        M: Model<Output = O>,
    {
        let output = model.forward(&batch.input)?;
        let loss = self.loss.value(&output, &batch.target)?;
        if !loss.is_finite() {
            return Err(TrainError::compute(format!(
                "non-finite loss {loss} at batch {index}"
            )));
        }
        let values = self.metrics.compute(&output, &batch.target)?;
        self.step(model, &output, &batch.target)?;
        self.meters.metrics.update(&values)?;
        Ok(loss)
    }

    fn step<M>(&mut self, model: &mut M, output: &O, target: &T) -> Result<()>
    where
        M: Model<Output = O>,
    {
        match &mut self.variant {
            Variant::Evaluator => Ok(()),
            Variant::Trainer {
                optimizer,
                scheduler,
            } => {
                optimizer.zero_grad(model.parameters_mut());
                let grad = self.loss.gradient(output, target)?;
                model.backward(&grad)?;
                optimizer.step(model.parameters_mut())?;
                scheduler.step(&mut **optimizer);
                Ok(())
            }
        }
    }

    fn update_stats(
        &mut self,
        batch_time: Duration,
        data_time: Duration,
        loss: f64,
        batch_size: usize,
    ) -> Result<()> {
        let weight = i64::try_from(batch_size)
            .map_err(|_| TrainError::invalid_argument(format!("batch size {batch_size}")))?;
        self.meters.batch_time.update(batch_time.as_secs_f64());
        self.meters.data_time.update(data_time.as_secs_f64());
        self.meters.loss.update_weighted(loss, weight)
    }

    /// Averages of the most recent run's metric meters.
    pub fn metric_averages(&self) -> BTreeMap<String, f64> {
        self.meters.metrics.averages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::{InMemoryDataSource, Sample, tensor_batch};
    use crate::nn::{LinearRegressor, LrScheduler, MseLoss, Parameter, Sgd, Tensor};
    use crate::training::progress::RecordingReporter;
    use std::cell::RefCell;
    use std::sync::Mutex;

    fn samples(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let x = i as f64 / n as f64;
                Sample::new(vec![x, 1.0 - x], vec![3.0 * x - 1.0])
            })
            .collect()
    }

    fn bundle() -> Arc<MetricBundle<Tensor, Tensor>> {
        Arc::new(MetricBundle::regression(&["mae", "rmse"]).unwrap())
    }

    fn trainer(lr: f64) -> Runner<Tensor, Tensor> {
        Runner::trainer(
            Arc::new(MseLoss),
            bundle(),
            Box::new(Sgd::new(lr)),
            Box::new(LrScheduler::constant(lr)),
        )
    }

    fn evaluator() -> Runner<Tensor, Tensor> {
        Runner::evaluator(Arc::new(MseLoss), bundle())
    }

    #[test]
    fn test_run_visits_each_batch_once_in_order() {
        let mut data = InMemoryDataSource::new(samples(10), 3).unwrap();
        let mut model = LinearRegressor::new(2, 1);
        let recorder = RecordingReporter::new();
        let mut runner = evaluator().with_reporter(Box::new(recorder.clone()));

        let order = RefCell::new(Vec::new());
        let parser = |raw: Vec<Sample>| {
            order.borrow_mut().push(raw[0].features[0]);
            tensor_batch(raw)
        };
        runner.run(&mut model, &mut data, &parser, 0).unwrap();

        assert_eq!(order.into_inner(), vec![0.0, 0.3, 0.6, 0.9]);
        let indices: Vec<usize> = recorder.batches().iter().map(|b| b.batch).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert!(recorder.batches().iter().all(|b| b.total == 4));
        assert_eq!(recorder.epochs().len(), 1);
    }

    #[test]
    fn test_meters_reset_between_runs() {
        let mut data = InMemoryDataSource::new(samples(8), 4).unwrap();
        let mut model = LinearRegressor::new(2, 1);
        let mut runner = evaluator();

        runner.run(&mut model, &mut data, &tensor_batch, 0).unwrap();
        runner.run(&mut model, &mut data, &tensor_batch, 1).unwrap();
        assert_eq!(runner.meters().loss.count(), 8);
        assert_eq!(runner.meters().batch_time.count(), 2);
        assert_eq!(runner.meters().metrics.get("mae").unwrap().count(), 2);
    }

    #[test]
    fn test_evaluator_is_deterministic_and_read_only() {
        let mut data = InMemoryDataSource::new(samples(12), 5).unwrap();
        let mut model = LinearRegressor::seeded(2, 1, 3);
        let before = model.state_dict();
        let mut runner = evaluator();

        let first = runner.run(&mut model, &mut data, &tensor_batch, 0).unwrap();
        let second = runner.run(&mut model, &mut data, &tensor_batch, 0).unwrap();

        assert_eq!(first, second);
        assert_eq!(model.state_dict(), before);
        assert_eq!(model.mode(), Mode::Eval);
    }

    #[test]
    fn test_trainer_changes_parameters_and_lowers_loss() {
        let mut data = InMemoryDataSource::new(samples(16), 4).unwrap();
        let mut model = LinearRegressor::new(2, 1);
        let mut eval = evaluator();
        let mut train = trainer(0.1);

        eval.run(&mut model, &mut data, &tensor_batch, 0).unwrap();
        let baseline = eval.meters().loss.average();

        train.run(&mut model, &mut data, &tensor_batch, 0).unwrap();
        assert_eq!(model.mode(), Mode::Train);

        eval.run(&mut model, &mut data, &tensor_batch, 0).unwrap();
        let after = eval.meters().loss.average();
        assert_ne!(after, baseline);
        assert!(after < baseline, "{after} should be below {baseline}");
    }

    #[test]
    fn test_injected_clock_gives_exact_timings() {
        let mut data = InMemoryDataSource::new(samples(6), 2).unwrap();
        let mut model = LinearRegressor::new(2, 1);
        let recorder = RecordingReporter::new();
        let mut runner = evaluator()
            .with_clock(Arc::new(ManualClock::new(Duration::from_secs(1))))
            .with_reporter(Box::new(recorder.clone()));

        runner.run(&mut model, &mut data, &tensor_batch, 0).unwrap();

        assert_eq!(runner.meters().data_time.average(), 1.0);
        assert_eq!(runner.meters().batch_time.average(), 2.0);
        let epoch = &recorder.epochs()[0];
        assert_eq!(epoch.batches, 3);
        assert_eq!(epoch.elapsed, 10.0);
    }

    #[test]
    fn test_loss_meter_is_weighted_by_batch_size() {
        let data_samples = vec![
            Sample::new(vec![0.0], vec![1.0]),
            Sample::new(vec![0.0], vec![1.0]),
            Sample::new(vec![0.0], vec![3.0]),
        ];
        let mut data = InMemoryDataSource::new(data_samples, 2).unwrap();
        let mut model = LinearRegressor::new(1, 1);
        let mut runner = evaluator();
        runner.run(&mut model, &mut data, &tensor_batch, 0).unwrap();

        // batch losses 1.0 (x2) and 9.0 (x1)
        assert_eq!(runner.meters().loss.average(), 11.0 / 3.0);
        // metric meters average per batch: (1 + 3) / 2
        assert_eq!(runner.metric_averages()["mae"], 2.0);
    }

    #[test]
    fn test_parse_failure_aborts_epoch() {
        let mut data = InMemoryDataSource::new(samples(6), 2).unwrap();
        let mut model = LinearRegressor::new(2, 1);
        let mut runner = trainer(0.1);
        let calls = RefCell::new(0);
        let parser = |raw: Vec<Sample>| {
            *calls.borrow_mut() += 1;
            if *calls.borrow() == 2 {
                return Err(TrainError::data_format("corrupt image"));
            }
            tensor_batch(raw)
        };

        let err = runner.run(&mut model, &mut data, &parser, 0).unwrap_err();
        assert!(matches!(err, TrainError::DataFormat(_)));
        assert_eq!(*calls.borrow(), 2);
    }

    #[test]
    fn test_forward_failure_is_compute_error() {
        let mut data = InMemoryDataSource::new(samples(4), 2).unwrap();
        let mut model = LinearRegressor::new(3, 1);
        let err = evaluator()
            .run(&mut model, &mut data, &tensor_batch, 0)
            .unwrap_err();
        assert!(matches!(err, TrainError::Compute(_)));
    }

    struct LyingSource(InMemoryDataSource);

    impl DataSource for LyingSource {
        type Item = Vec<Sample>;

        fn len(&self) -> usize {
            self.0.len() + 1
        }

        fn batches(&mut self, epoch: usize) -> Box<dyn Iterator<Item = Vec<Sample>> + '_> {
            self.0.batches(epoch)
        }
    }

    #[test]
    fn test_batch_count_must_match_announced_length() {
        let mut data = LyingSource(InMemoryDataSource::new(samples(4), 2).unwrap());
        let mut model = LinearRegressor::new(2, 1);
        let err = evaluator()
            .run(&mut model, &mut data, &tensor_batch, 0)
            .unwrap_err();
        assert!(matches!(err, TrainError::DataFormat(_)));
    }

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct LoggingOptimizer {
        inner: Sgd,
        log: Log,
    }

    impl Optimizer for LoggingOptimizer {
        fn zero_grad(&mut self, params: &mut [Parameter]) {
            self.log.lock().unwrap().push("zero_grad");
            self.inner.zero_grad(params);
        }

        fn step(&mut self, params: &mut [Parameter]) -> Result<()> {
            self.log.lock().unwrap().push("step");
            self.inner.step(params)
        }

        fn learning_rate(&self) -> f64 {
            self.inner.learning_rate()
        }

        fn set_learning_rate(&mut self, lr: f64) {
            self.inner.set_learning_rate(lr);
        }

        fn state_dict(&self) -> Result<serde_json::Value> {
            self.inner.state_dict()
        }

        fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
            self.inner.load_state_dict(state)
        }
    }

    struct LoggingScheduler(Log);

    impl Scheduler for LoggingScheduler {
        fn step(&mut self, _optimizer: &mut dyn Optimizer) {
            self.0.lock().unwrap().push("schedule");
        }

        fn state_dict(&self) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }

        fn load_state_dict(&mut self, _state: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    struct LoggingModel {
        inner: LinearRegressor,
        log: Log,
    }

    impl Model for LoggingModel {
        type Input = Tensor;
        type Output = Tensor;

        fn set_mode(&mut self, mode: Mode) {
            self.inner.set_mode(mode);
        }

        fn mode(&self) -> Mode {
            self.inner.mode()
        }

        fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
            self.log.lock().unwrap().push("forward");
            self.inner.forward(input)
        }

        fn backward(&mut self, grad_output: &Tensor) -> Result<()> {
            self.log.lock().unwrap().push("backward");
            self.inner.backward(grad_output)
        }

        fn parameters(&self) -> &[Parameter] {
            self.inner.parameters()
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            self.inner.parameters_mut()
        }
    }

    #[test]
    fn test_trainer_update_order_per_batch() {
        let log: Log = Arc::default();
        let mut model = LoggingModel {
            inner: LinearRegressor::new(2, 1),
            log: log.clone(),
        };
        let mut runner = Runner::trainer(
            Arc::new(MseLoss),
            bundle(),
            Box::new(LoggingOptimizer {
                inner: Sgd::new(0.1),
                log: log.clone(),
            }),
            Box::new(LoggingScheduler(log.clone())),
        );
        let mut data = InMemoryDataSource::new(samples(4), 2).unwrap();
        runner.run(&mut model, &mut data, &tensor_batch, 0).unwrap();

        let per_batch = ["forward", "zero_grad", "backward", "step", "schedule"];
        let expected: Vec<&str> = per_batch.iter().chain(per_batch.iter()).copied().collect();
        assert_eq!(*log.lock().unwrap(), expected);
    }

    #[test]
    fn test_evaluator_never_backpropagates() {
        let log: Log = Arc::default();
        let mut model = LoggingModel {
            inner: LinearRegressor::new(2, 1),
            log: log.clone(),
        };
        let mut data = InMemoryDataSource::new(samples(4), 2).unwrap();
        evaluator()
            .run(&mut model, &mut data, &tensor_batch, 0)
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["forward", "forward"]);
    }
}
