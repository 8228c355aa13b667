//! Error types for throttled execution.
//!
//! Construction problems surface as [`ConfigError`] before any work runs.
//! Work-unit problems surface as [`TaskError`], of which only the first
//! observed one reaches the caller of a run.

use std::any::Any;
use std::time::Duration;

use tokio::task::JoinError;

/// Out-of-range construction parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("minimum interval must be greater than zero")]
    ZeroInterval,

    #[error("maximum interval ({max:?}) must be greater than or equal to minimum interval ({min:?})")]
    InvertedInterval { min: Duration, max: Duration },

    #[error("capacity must be greater than or equal to 1")]
    ZeroCapacity,

    #[error("max concurrency must be greater than or equal to 1")]
    ZeroConcurrency,

    #[error("{requested} permits exceeds the supported maximum of {max}")]
    TooManyPermits { requested: usize, max: usize },
}

/// Failure observed while running work units.
///
/// `E` is the error type returned by the caller's work units.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// A work unit returned `Err`.
    #[error("work unit failed: {0}")]
    Failed(E),

    /// A work unit panicked. Holds the panic message when it was a string.
    #[error("work unit panicked: {0}")]
    Panicked(String),

    /// A work unit's task was cancelled by the runtime before finishing.
    #[error("work unit was cancelled")]
    Cancelled,

    /// An earlier failure was already reported; the queue admits nothing more.
    #[error("queue halted after an earlier failure")]
    Halted,

    /// The queue was closed before the unit could be admitted.
    #[error("queue closed")]
    Closed,
}

impl<E> TaskError<E> {
    /// True if a work unit itself returned an error.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// The work unit's own error, if that is what this is.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::Panicked(_) => "panicked",
            Self::Cancelled => "cancelled",
            Self::Halted => "halted",
            Self::Closed => "closed",
        }
    }
}

impl<E> From<JoinError> for TaskError<E> {
    fn from(err: JoinError) -> Self {
        match err.try_into_panic() {
            Ok(payload) => Self::Panicked(panic_message(payload.as_ref())),
            Err(_) => Self::Cancelled,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Returned by [`RateLimiter::wait`](crate::RateLimiter::wait) once the
/// limiter has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rate limiter closed")]
pub struct LimiterClosed;
