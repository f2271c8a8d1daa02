//! Error types for the Sluice service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Sluice operations.
#[derive(Error, Debug)]
pub enum SluiceError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bucket was described with a size of zero
    #[error("buckets cannot have size 0")]
    EmptyBucket,

    /// A bucket was described with a zero decay interval
    #[error("buckets cannot have a zero interval")]
    ZeroInterval,

    /// A bucket was described with a decay interval above the supported maximum
    #[error("bucket interval exceeds the maximum of {max:?}")]
    IntervalTooLong { max: std::time::Duration },

    /// Transactional store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),
}

impl From<::config::ConfigError> for SluiceError {
    fn from(err: ::config::ConfigError) -> Self {
        SluiceError::Config(err.to_string())
    }
}

/// Result type alias for Sluice operations.
pub type Result<T> = std::result::Result<T, SluiceError>;
