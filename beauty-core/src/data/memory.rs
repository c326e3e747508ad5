//! In-memory data source with seeded per-epoch shuffling.

use crate::data::{Batch, DataSource};
use crate::error::{Result, TrainError};
use crate::nn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// One `(features, target)` example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub features: Vec<f64>,
    pub target: Vec<f64>,
}

impl Sample {
    pub fn new(features: Vec<f64>, target: Vec<f64>) -> Self {
        Self { features, target }
    }
}

/// Samples held in memory, served in fixed-size batches.
///
/// With a shuffle seed the order of epoch `e` depends only on `(seed, e)`, so
/// a resumed run sees the same batches as an uninterrupted one.
#[derive(Debug, Clone)]
pub struct InMemoryDataSource {
    samples: Vec<Sample>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl InMemoryDataSource {
    pub fn new(samples: Vec<Sample>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainError::invalid_argument("batch size must be > 0"));
        }
        Ok(Self {
            samples,
            batch_size,
            shuffle_seed: None,
        })
    }

    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }
}

impl DataSource for InMemoryDataSource {
    type Item = Vec<Sample>;

    fn len(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    fn batches(&mut self, epoch: usize) -> Box<dyn Iterator<Item = Vec<Sample>> + '_> {
        let order = self.order(epoch);
        let batch_size = self.batch_size;
        let samples = &self.samples;
        let batches: Vec<Vec<usize>> = order.chunks(batch_size).map(<[usize]>::to_vec).collect();
        Box::new(
            batches
                .into_iter()
                .map(move |idx| idx.into_iter().map(|i| samples[i].clone()).collect()),
        )
    }
}

/// Stack a raw batch of samples into `[batch, features]` / `[batch, targets]`.
pub fn tensor_batch(raw: Vec<Sample>) -> Result<Batch<Tensor, Tensor>> {
    let first = raw
        .first()
        .ok_or_else(|| TrainError::data_format("empty batch"))?;
    let (width, outputs) = (first.features.len(), first.target.len());
    if let Some(pos) = raw
        .iter()
        .position(|s| s.features.len() != width || s.target.len() != outputs)
    {
        return Err(TrainError::data_format(format!(
            "sample {pos} has {} features / {} targets, expected {width} / {outputs}",
            raw[pos].features.len(),
            raw[pos].target.len()
        )));
    }
    if let Some(pos) = raw
        .iter()
        .position(|s| s.features.iter().chain(&s.target).any(|v| !v.is_finite()))
    {
        return Err(TrainError::data_format(format!(
            "sample {pos} contains a non-finite value"
        )));
    }

    let size = raw.len();
    let mut features = Vec::with_capacity(size * width);
    let mut targets = Vec::with_capacity(size * outputs);
    for sample in raw {
        features.extend(sample.features);
        targets.extend(sample.target);
    }
    Ok(Batch {
        input: Tensor::new(vec![size, width], features)?,
        target: Tensor::new(vec![size, outputs], targets)?,
        size,
    })
}

/// Linear-regression samples `y = x·w + 0.5 + noise` with a seeded ground truth.
pub fn synthetic_regression(count: usize, features: usize, noise: f64, seed: u64) -> Vec<Sample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let weights: Vec<f64> = (0..features).map(|_| rng.gen_range(-2.0..2.0)).collect();
    (0..count)
        .map(|_| {
            let x: Vec<f64> = (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let clean: f64 = x.iter().zip(&weights).map(|(a, b)| a * b).sum::<f64>() + 0.5;
            let jitter = if noise > 0.0 {
                rng.gen_range(-noise..noise)
            } else {
                0.0
            };
            Sample::new(x, vec![clean + jitter])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Batch, ParseBatch};

    fn numbered(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::new(vec![i as f64], vec![i as f64]))
            .collect()
    }

    fn firsts(source: &mut InMemoryDataSource, epoch: usize) -> Vec<f64> {
        source
            .batches(epoch)
            .flatten()
            .map(|s| s.features[0])
            .collect()
    }

    #[test]
    fn test_len_counts_partial_batch() {
        let source = InMemoryDataSource::new(numbered(10), 4).unwrap();
        assert_eq!(source.len(), 3);
        assert!(InMemoryDataSource::new(numbered(3), 0).is_err());
    }

    #[test]
    fn test_unshuffled_order_is_sequential() {
        let mut source = InMemoryDataSource::new(numbered(5), 2).unwrap();
        let sizes: Vec<usize> = source.batches(0).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(firsts(&mut source, 3), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_shuffle_is_deterministic_per_epoch() {
        let mut a = InMemoryDataSource::new(numbered(32), 8).unwrap().with_shuffle(9);
        let mut b = InMemoryDataSource::new(numbered(32), 8).unwrap().with_shuffle(9);
        assert_eq!(firsts(&mut a, 1), firsts(&mut b, 1));
        assert_ne!(firsts(&mut a, 1), firsts(&mut a, 2));

        let mut seen = firsts(&mut a, 4);
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, (0..32).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_tensor_batch_validates() {
        let batch = tensor_batch(numbered(3)).unwrap();
        assert_eq!(batch.size, 3);
        assert_eq!(batch.input.shape(), &[3, 1]);

        assert!(matches!(tensor_batch(vec![]), Err(TrainError::DataFormat(_))));
        let ragged = vec![Sample::new(vec![1.0], vec![1.0]), Sample::new(vec![], vec![1.0])];
        assert!(matches!(tensor_batch(ragged), Err(TrainError::DataFormat(_))));
        let nan = vec![Sample::new(vec![f64::NAN], vec![1.0])];
        assert!(matches!(tensor_batch(nan), Err(TrainError::DataFormat(_))));
    }

    #[test]
    fn test_fn_parser_blanket_impl() {
        let parser = tensor_batch;
        let batch: Batch<Tensor, Tensor> = parser.parse(numbered(2)).unwrap();
        assert_eq!(batch.target.data(), &[0.0, 1.0]);
    }

    #[test]
    fn test_synthetic_regression_is_seeded() {
        let a = synthetic_regression(16, 3, 0.1, 5);
        let b = synthetic_regression(16, 3, 0.1, 5);
        assert_eq!(a, b);
        assert_eq!(a[0].features.len(), 3);
        assert_ne!(a, synthetic_regression(16, 3, 0.1, 6));
    }
}
