//! Error types for the beauty-core crate.

use thiserror::Error;

/// Top-level error type for training operations.
///
/// None of these are recovered inside the runners or the checkpoint store;
/// they propagate to the training loop, which treats every one as fatal for
/// the current run.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Malformed argument, e.g. a negative meter weight or an unknown metric name.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A raw batch could not be converted into `(input, target)`.
    #[error("Data format error: {0}")]
    DataFormat(String),

    /// Forward or backward computation failed.
    #[error("Compute error: {0}")]
    Compute(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn data_format(msg: impl Into<String>) -> Self {
        Self::DataFormat(msg.into())
    }

    pub fn compute(msg: impl Into<String>) -> Self {
        Self::Compute(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

impl From<figment::Error> for TrainError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = TrainError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_message() {
        let err = TrainError::compute("shape mismatch: [2, 3] vs [3, 2]");
        assert_eq!(
            err.to_string(),
            "Compute error: shape mismatch: [2, 3] vs [3, 2]"
        );
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: TrainError = io.into();
        assert!(matches!(err, TrainError::Io(_)));
    }
}
