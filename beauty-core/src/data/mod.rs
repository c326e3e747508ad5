//! Data sources: batch iteration and raw-batch parsing.

pub mod csv;
pub mod memory;

pub use csv::CsvSource;
pub use memory::{InMemoryDataSource, Sample, synthetic_regression, tensor_batch};

use crate::error::Result;

/// A finite, ordered, restartable sequence of raw batches per epoch.
///
/// `len()` is the number of batches one call to `batches()` yields and must
/// be known before iteration starts.
pub trait DataSource {
    type Item;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches for `epoch`, in the order they must be processed.
    fn batches(&mut self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + '_>;
}

/// One parsed batch ready for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<I, T> {
    pub input: I,
    pub target: T,
    /// Number of samples, used to weight the loss meter.
    pub size: usize,
}

/// Conversion from a raw batch to `(input, target)`.
pub trait ParseBatch<Raw, I, T> {
    fn parse(&self, raw: Raw) -> Result<Batch<I, T>>;
}

impl<Raw, I, T, F> ParseBatch<Raw, I, T> for F
where
    F: Fn(Raw) -> Result<Batch<I, T>>,
{
    fn parse(&self, raw: Raw) -> Result<Batch<I, T>> {
        self(raw)
    }
}
