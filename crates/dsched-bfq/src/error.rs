//! Error types for the BFQ scheduler.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type BfqResult<T> = Result<T, BfqError>;

/// Error variants for scheduler operations.
///
/// None of these describe a failed I/O: queued requests are always either
/// dispatched or handed back through the driver's cancel path.
#[derive(Debug, Error)]
pub enum BfqError {
    /// Wraps standard I/O errors (config file loading).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid config: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// `teardown` was called on a scheduler that is not prepared.
    #[error("Scheduler not prepared")]
    NotPrepared,

    /// `prepare` was called twice without an intervening `teardown`.
    #[error("Scheduler already prepared")]
    AlreadyPrepared,

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    Serialization {
        /// Description of the error.
        reason: String,
    },
}

impl From<serde_json::Error> for BfqError {
    fn from(err: serde_json::Error) -> Self {
        BfqError::Serialization {
            reason: err.to_string(),
        }
    }
}
