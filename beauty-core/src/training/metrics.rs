//! Metric bundle: named batch metrics and their meter factories.

use crate::error::{Result, TrainError};
use crate::nn::tensor::Tensor;
use crate::training::meters::{BestMeters, MetricMeters};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which direction of a metric counts as an improvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    HigherIsBetter,
    LowerIsBetter,
}

impl Polarity {
    /// Strict improvement of `candidate` over `incumbent`.
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Polarity::HigherIsBetter => candidate > incumbent,
            Polarity::LowerIsBetter => candidate < incumbent,
        }
    }
}

/// A scalar metric computed from one batch of `(output, target)`.
pub trait Metric<O, T>: Send + Sync {
    fn name(&self) -> &str;

    fn polarity(&self) -> Polarity;

    fn compute(&self, output: &O, target: &T) -> Result<f64>;
}

/// A fixed set of uniquely named metrics.
pub struct MetricBundle<O, T> {
    metrics: Vec<Box<dyn Metric<O, T>>>,
}

impl<O, T> MetricBundle<O, T> {
    pub fn new(metrics: Vec<Box<dyn Metric<O, T>>>) -> Result<Self> {
        for (i, metric) in metrics.iter().enumerate() {
            if metric.name().is_empty() {
                return Err(TrainError::invalid_argument("metric name must not be empty"));
            }
            if metrics[..i].iter().any(|m| m.name() == metric.name()) {
                return Err(TrainError::invalid_argument(format!(
                    "duplicate metric name '{}'",
                    metric.name()
                )));
            }
        }
        Ok(Self { metrics })
    }

    pub fn empty() -> Self {
        Self {
            metrics: Vec::new(),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Fresh running-average meter per metric.
    pub fn create_average_meters(&self) -> MetricMeters {
        MetricMeters::new(self.names())
    }

    /// Best-so-far tracker per metric, oriented by each metric's polarity.
    pub fn create_best_meters(&self) -> BestMeters {
        BestMeters::new(self.metrics.iter().map(|m| (m.name(), m.polarity())))
    }

    /// Every metric for one batch.
    pub fn compute(&self, output: &O, target: &T) -> Result<BTreeMap<String, f64>> {
        self.metrics
            .iter()
            .map(|m| Ok((m.name().to_string(), m.compute(output, target)?)))
            .collect()
    }
}

impl<O, T> std::fmt::Debug for MetricBundle<O, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl MetricBundle<Tensor, Tensor> {
    /// Bundle of built-in regression metrics selected by name.
    pub fn regression<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let metrics = names
            .iter()
            .map(|n| {
                builtin(n.as_ref()).ok_or_else(|| {
                    TrainError::invalid_argument(format!("unknown metric '{}'", n.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(metrics)
    }
}

/// Look up a built-in tensor metric: `mae`, `rmse` or `pearson`.
pub fn builtin(name: &str) -> Option<Box<dyn Metric<Tensor, Tensor>>> {
    match name {
        "mae" => Some(Box::new(MeanAbsoluteError)),
        "rmse" => Some(Box::new(RootMeanSquaredError)),
        "pearson" => Some(Box::new(PearsonCorrelation)),
        _ => None,
    }
}

fn paired<'a>(output: &'a Tensor, target: &'a Tensor, what: &str) -> Result<(&'a [f64], &'a [f64])> {
    output.expect_shape(target, what)?;
    if output.is_empty() {
        return Err(TrainError::compute(format!("{what} over an empty batch")));
    }
    Ok((output.data(), target.data()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsoluteError;

impl Metric<Tensor, Tensor> for MeanAbsoluteError {
    fn name(&self) -> &str {
        "mae"
    }

    fn polarity(&self) -> Polarity {
        Polarity::LowerIsBetter
    }

    fn compute(&self, output: &Tensor, target: &Tensor) -> Result<f64> {
        let (o, t) = paired(output, target, "mae")?;
        Ok(o.iter().zip(t).map(|(a, b)| (a - b).abs()).sum::<f64>() / o.len() as f64)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RootMeanSquaredError;

impl Metric<Tensor, Tensor> for RootMeanSquaredError {
    fn name(&self) -> &str {
        "rmse"
    }

    fn polarity(&self) -> Polarity {
        Polarity::LowerIsBetter
    }

    fn compute(&self, output: &Tensor, target: &Tensor) -> Result<f64> {
        let (o, t) = paired(output, target, "rmse")?;
        let mse = o.iter().zip(t).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / o.len() as f64;
        Ok(mse.sqrt())
    }
}

/// Pearson correlation between predictions and targets.
///
/// A batch with zero variance on either side has no defined correlation and
/// reports `0.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PearsonCorrelation;

impl Metric<Tensor, Tensor> for PearsonCorrelation {
    fn name(&self) -> &str {
        "pearson"
    }

    fn polarity(&self) -> Polarity {
        Polarity::HigherIsBetter
    }

    fn compute(&self, output: &Tensor, target: &Tensor) -> Result<f64> {
        let (o, t) = paired(output, target, "pearson")?;
        let n = o.len() as f64;
        let mean_o = o.iter().sum::<f64>() / n;
        let mean_t = t.iter().sum::<f64>() / n;
        let (mut cov, mut var_o, mut var_t) = (0.0, 0.0, 0.0);
        for (a, b) in o.iter().zip(t) {
            let (da, db) = (a - mean_o, b - mean_t);
            cov += da * db;
            var_o += da * da;
            var_t += db * db;
        }
        let denom = (var_o * var_t).sqrt();
        if denom == 0.0 {
            return Ok(0.0);
        }
        Ok(cov / denom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(values: &[f64]) -> Tensor {
        Tensor::new(vec![values.len(), 1], values.to_vec()).unwrap()
    }

    #[test]
    fn test_builtin_values() {
        let o = column(&[1.0, 2.0, 3.0]);
        let t = column(&[1.0, 2.0, 5.0]);
        assert!((MeanAbsoluteError.compute(&o, &t).unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!((RootMeanSquaredError.compute(&o, &t).unwrap() - (4.0f64 / 3.0).sqrt()).abs() < 1e-12);

        let perfect = PearsonCorrelation.compute(&o, &column(&[2.0, 4.0, 6.0])).unwrap();
        assert!((perfect - 1.0).abs() < 1e-12);
        let flat = PearsonCorrelation.compute(&o, &column(&[1.0, 1.0, 1.0])).unwrap();
        assert_eq!(flat, 0.0);
    }

    #[test]
    fn test_bundle_rejects_duplicates_and_unknown() {
        assert!(matches!(
            MetricBundle::regression(&["mae", "mae"]),
            Err(TrainError::InvalidArgument(_))
        ));
        assert!(MetricBundle::regression(&["accuracy"]).is_err());
    }

    #[test]
    fn test_bundle_compute_and_factories() {
        let bundle = MetricBundle::regression(&["mae", "pearson"]).unwrap();
        let values = bundle
            .compute(&column(&[1.0, 2.0]), &column(&[1.0, 3.0]))
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["mae"], 0.5);

        let meters = bundle.create_average_meters();
        assert_eq!(meters.names().collect::<Vec<_>>(), vec!["mae", "pearson"]);
        let best = bundle.create_best_meters();
        assert_eq!(best.polarity("pearson"), Some(Polarity::HigherIsBetter));
        assert_eq!(best.polarity("mae"), Some(Polarity::LowerIsBetter));
    }

    #[test]
    fn test_polarity() {
        assert!(Polarity::LowerIsBetter.is_better(0.1, 0.2));
        assert!(!Polarity::LowerIsBetter.is_better(0.2, 0.2));
        assert!(Polarity::HigherIsBetter.is_better(0.3, 0.2));
    }
}
