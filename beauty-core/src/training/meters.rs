//! Running-statistics accumulators.
//!
//! [`StatMeter`] is the leaf accumulator. [`MetricMeters`] holds one meter per
//! metric name for the current run; [`BestMeters`] remembers the best
//! per-metric average observed across runs.

use crate::error::{Result, TrainError};
use crate::training::metrics::Polarity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Weighted running average of a scalar stream.
///
/// `average()` is `Σ(vᵢ·wᵢ) / Σwᵢ`, and `0.0` while nothing has been counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatMeter {
    sum: f64,
    count: u64,
    last: f64,
}

impl StatMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record one observation with unit weight.
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    /// Record an observation counted `weight` times.
    pub fn update_weighted(&mut self, value: f64, weight: i64) -> Result<()> {
        let weight = u64::try_from(weight).map_err(|_| {
            TrainError::invalid_argument(format!("meter weight must be >= 0, got {weight}"))
        })?;
        self.sum += value * weight as f64;
        self.count += weight;
        self.last = value;
        Ok(())
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }
}

impl fmt::Display for StatMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} ({:.4})", self.last, self.average())
    }
}

/// One running-average meter per metric name.
///
/// The name set is fixed at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricMeters {
    meters: BTreeMap<String, StatMeter>,
}

impl MetricMeters {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            meters: names
                .into_iter()
                .map(|n| (n.into(), StatMeter::new()))
                .collect(),
        }
    }

    pub fn reset(&mut self) {
        self.meters.values_mut().for_each(StatMeter::reset);
    }

    /// Add one batch of metric values; the key set must match exactly.
    ///
    /// Nothing is recorded if the keys don't match.
    pub fn update(&mut self, values: &BTreeMap<String, f64>) -> Result<()> {
        if let Some(unknown) = values.keys().find(|k| !self.meters.contains_key(*k)) {
            return Err(TrainError::invalid_argument(format!(
                "unknown metric '{unknown}'"
            )));
        }
        if let Some(missing) = self.meters.keys().find(|k| !values.contains_key(*k)) {
            return Err(TrainError::invalid_argument(format!(
                "no value for metric '{missing}'"
            )));
        }
        for (name, meter) in &mut self.meters {
            meter.update(values[name]);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&StatMeter> {
        self.meters.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.meters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StatMeter)> {
        self.meters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Current running average of every metric.
    pub fn averages(&self) -> BTreeMap<String, f64> {
        self.meters
            .iter()
            .map(|(k, v)| (k.clone(), v.average()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }
}

impl fmt::Display for MetricMeters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, meter)) in self.meters.iter().enumerate() {
            if i > 0 {
                f.write_str("\t")?;
            }
            write!(f, "{name} {meter}")?;
        }
        Ok(())
    }
}

/// Best value seen so far for a single metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestEntry {
    pub polarity: Polarity,
    pub best: Option<f64>,
}

/// Best-so-far tracker, independent per metric.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestMeters {
    entries: BTreeMap<String, BestEntry>,
}

impl BestMeters {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = (S, Polarity)>,
        S: Into<String>,
    {
        Self {
            entries: metrics
                .into_iter()
                .map(|(name, polarity)| {
                    (
                        name.into(),
                        BestEntry {
                            polarity,
                            best: None,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Fold in one round of averages, returning the names that improved.
    ///
    /// A NaN average never becomes the best value, and neither does a meter
    /// that counted nothing: its average is undefined.
    pub fn update(&mut self, current: &MetricMeters) -> Result<BTreeSet<String>> {
        if let Some(missing) = self.entries.keys().find(|k| current.get(k).is_none()) {
            return Err(TrainError::invalid_argument(format!(
                "round has no meter for tracked metric '{missing}'"
            )));
        }
        let mut improved = BTreeSet::new();
        for (name, entry) in &mut self.entries {
            let Some(meter) = current.get(name).filter(|m| m.count() > 0) else {
                continue;
            };
            let value = meter.average();
            let better = match entry.best {
                _ if value.is_nan() => false,
                None => true,
                Some(best) => entry.polarity.is_better(value, best),
            };
            if better {
                entry.best = Some(value);
                improved.insert(name.clone());
            }
        }
        Ok(improved)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.get(name).and_then(|e| e.best)
    }

    pub fn polarity(&self, name: &str) -> Option<Polarity> {
        self.entries.get(name).map(|e| e.polarity)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Best values for the metrics that have one.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.best.map(|b| (k.clone(), b)))
            .collect()
    }

    /// Reload best values from a snapshot; names must be tracked here.
    pub fn restore(&mut self, snapshot: &BTreeMap<String, f64>) -> Result<()> {
        if let Some(unknown) = snapshot.keys().find(|k| !self.entries.contains_key(*k)) {
            return Err(TrainError::invalid_argument(format!(
                "snapshot tracks unknown metric '{unknown}'"
            )));
        }
        for (name, entry) in &mut self.entries {
            entry.best = snapshot.get(name).copied();
        }
        Ok(())
    }
}

impl fmt::Display for BestMeters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, entry)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("\t")?;
            }
            match entry.best {
                Some(best) => write!(f, "{name} {best:.4}")?,
                None => write!(f, "{name} -")?,
            }
        }
        Ok(())
    }
}
