//! Typed failure kinds shared across the workers and the websocket surface.
//!
//! Workers absorb their own failures (retry or drop); nothing here crosses
//! the hub task. Clients only ever observe `ErrorCode` values inside error
//! frames for their own requests.

use thiserror::Error;

/// Failure of a repository or kv call.
///
/// `Transient` is retriable within a worker's retry budget; `Fatal` means
/// the store returned something malformed or impossible and the job is
/// dropped after logging.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StoreError::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        StoreError::Fatal(msg.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Non-blocking queue submission failure.
///
/// Every producer-side send in the system is a `try_send`; a full queue is
/// reported to the caller and counted, never blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("{queue} queue is full (capacity {capacity})")]
    QueueFull {
        queue: &'static str,
        capacity: usize,
    },
    #[error("{queue} queue is closed")]
    Closed { queue: &'static str },
}

/// Validation failures raised while handling a client frame.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid location: {0}")]
    InvalidLocation(String),
    #[error("not authenticated")]
    Unauthorized,
    #[error("rate limit exceeded for {action}")]
    RateLimited { action: &'static str },
    #[error("circle not found: {0}")]
    CircleNotFound(uuid::Uuid),
    #[error("user not found: {0}")]
    UserNotFound(uuid::Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_tags() {
        assert!(StoreError::transient("timeout").is_transient());
        assert!(!StoreError::fatal("bad row").is_transient());
    }

    #[test]
    fn submit_error_display_names_queue() {
        let err = SubmitError::QueueFull {
            queue: "location",
            capacity: 1000,
        };
        assert_eq!(err.to_string(), "location queue is full (capacity 1000)");
    }
}
