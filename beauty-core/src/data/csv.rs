//! Numeric CSV loader.
//!
//! The trailing `target_columns` columns of every row are the target, the
//! rest are features. The first non-empty line is a header.

use crate::data::memory::Sample;
use crate::error::{Result, TrainError};
use std::path::PathBuf;

/// CSV file of numeric samples.
#[derive(Debug, Clone)]
pub struct CsvSource {
    pub path: PathBuf,
    pub delimiter: char,
    pub target_columns: usize,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: ',',
            target_columns: 1,
        }
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_target_columns(mut self, columns: usize) -> Self {
        self.target_columns = columns;
        self
    }

    /// Read every row into a [`Sample`].
    pub fn load(&self) -> Result<Vec<Sample>> {
        if !self.path.exists() {
            return Err(TrainError::not_found(format!(
                "dataset {}",
                self.path.display()
            )));
        }
        let content = std::fs::read_to_string(&self.path)?;
        self.parse(&content)
    }

    fn parse(&self, content: &str) -> Result<Vec<Sample>> {
        let mut lines = content
            .lines()
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        let (_, header) = lines
            .next()
            .ok_or_else(|| TrainError::data_format("empty CSV file"))?;
        let columns = header.split(self.delimiter).count();
        if self.target_columns == 0 || self.target_columns >= columns {
            return Err(TrainError::data_format(format!(
                "{columns} columns cannot hold {} target column(s) and at least one feature",
                self.target_columns
            )));
        }

        let mut samples = Vec::new();
        for (line_no, line) in lines {
            let values = line
                .split(self.delimiter)
                .map(|s| {
                    let s = s.trim().trim_matches('"');
                    s.parse::<f64>().map_err(|_| {
                        TrainError::data_format(format!(
                            "line {}: '{s}' is not a number",
                            line_no + 1
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            if values.len() != columns {
                return Err(TrainError::data_format(format!(
                    "line {}: expected {columns} columns, found {}",
                    line_no + 1,
                    values.len()
                )));
            }
            let split = columns - self.target_columns;
            samples.push(Sample::new(values[..split].to_vec(), values[split..].to_vec()));
        }
        Ok(samples)
    }
}
