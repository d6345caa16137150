//! Error types for the pipeline runtime.
//!
//! Errors fall into two families. Operation failures and cancellations are
//! recoverable: they travel through result streams as data. Channel misuse and
//! configuration errors are not: they abort the call that triggered them.

use std::sync::Arc;

use crate::cancel::CancelCause;

/// The main error type for the pipeline runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A job's or transform's user function failed
    #[error("operation failed: {0}")]
    Operation(Arc<dyn std::error::Error + Send + Sync>),

    /// A cancellation token fired while a unit was suspended
    #[error("cancelled: {0}")]
    Cancelled(CancelCause),

    /// Send on a closed channel, or a second explicit close
    #[error("channel is closed")]
    ChannelClosed,

    /// Invalid construction parameters
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The worker pool no longer accepts jobs
    #[error("worker pool was shut down")]
    Shutdown,

    /// The rate limiter refused admission under the reject policy
    #[error("rate limited: {requested} tokens not available")]
    RateLimited { requested: f64 },

    /// A non-blocking submission found the queue full
    #[error("queue at capacity: {current}/{max}")]
    Capacity { current: usize, max: usize },

    /// An operation timed out
    #[error("timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// A spawned unit panicked or was aborted
    #[error("task failed: {0}")]
    TaskFailed(String),
}

// Convenience constructors
impl Error {
    /// Wrap a user function's error
    pub fn operation<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Operation(Arc::new(error))
    }

    /// Create a configuration error with a message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    /// Create a timeout error
    pub fn timeout(duration: std::time::Duration) -> Self {
        Error::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Create a capacity error
    pub fn capacity(current: usize, max: usize) -> Self {
        Error::Capacity { current, max }
    }

    /// True if this error reports a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// True if this error came from a user-supplied function.
    pub fn is_operation(&self) -> bool {
        matches!(self, Error::Operation(_))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::TaskFailed(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout { duration_ms: 0 }
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for lifting foreign errors into [`Error::Operation`]
pub trait IntoOperationError<T> {
    fn into_operation_error(self) -> Result<T>;
}

impl<T, E> IntoOperationError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_operation_error(self) -> Result<T> {
        self.map_err(Error::operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_operation_error_display_and_source() {
        let err = Error::operation(Boom);
        assert!(err.is_operation());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "operation failed: boom");
    }

    #[test]
    fn test_into_operation_error() {
        let res: std::result::Result<(), Boom> = Err(Boom);
        assert!(matches!(res.into_operation_error(), Err(Error::Operation(_))));
    }

    #[test]
    fn test_cancelled_display() {
        let err = Error::Cancelled(CancelCause::Reason("shutting down".into()));
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "cancelled: shutting down");
    }
}
