//! Error types for taskq.
//!
//! Infrastructure faults (`StoreUnavailable`) are retried close to the store.
//! Task-domain faults never show up here: a failing computation becomes an
//! [`Outcome::Failure`](crate::model::Outcome) on the published result.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A submitted task failed schema validation. Nothing was enqueued.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// A result stream was requested without a client identifier.
    #[error("clientId query parameter is required")]
    MissingClientId,

    /// The backing store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A task with this identifier is already pending or in flight.
    #[error("task {0} is already queued")]
    DuplicateTask(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Transient infrastructure fault worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
