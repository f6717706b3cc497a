//! Error types for bucketguard.

use thiserror::Error;

use crate::ratelimit::{PolicyError, ScheduleError};

/// Main error type for bucketguard operations.
#[derive(Error, Debug)]
pub enum BucketguardError {
    /// The policy string could not be parsed
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The decay job could not be scheduled
    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for BucketguardError {
    fn from(err: ::config::ConfigError) -> Self {
        BucketguardError::Config(err.to_string())
    }
}

/// Result type alias for bucketguard operations.
pub type Result<T> = std::result::Result<T, BucketguardError>;
