//! Error taxonomy for the engine.

use thiserror::Error;

use crate::correlation::MarkerReason;
use crate::types::CorrelationId;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Enqueue could not complete within the configured wait.
    #[error("enqueue timed out after {timeout_ms}ms (queue capacity {capacity})")]
    QueueTimeout { timeout_ms: u64, capacity: usize },

    /// Enqueue rejected because the queue is full and the overflow policy rejects.
    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Enqueue attempted while the pool is not accepting work.
    #[error("queue closed: worker pool is {state}")]
    QueueClosed { state: String },

    /// No processing unit became available within the borrow timeout.
    #[error("no processing unit available within {timeout_ms}ms")]
    PoolExhausted { timeout_ms: u64 },

    /// No reply arrived within the configured timeout and grace window.
    #[error("no reply for correlation id '{correlation_id}' within {waited_ms}ms")]
    ResponseTimeout {
        correlation_id: CorrelationId,
        waited_ms: u64,
    },

    /// A second result was stored for an id already holding one.
    #[error("duplicate result for correlation id '{correlation_id}'")]
    DuplicateResult { correlation_id: CorrelationId },

    /// A live waiter already exists for this correlation id.
    #[error("a reply waiter is already registered for '{correlation_id}'")]
    WaiterExists { correlation_id: CorrelationId },

    /// The correlation id already reached a terminal state.
    #[error("correlation id '{correlation_id}' already {reason}")]
    CorrelationAlreadyProcessed {
        correlation_id: CorrelationId,
        reason: MarkerReason,
    },

    /// The dispatch sink refused the request.
    #[error("dispatch failed: {reason}")]
    Dispatch { reason: String },

    /// The reply store failed.
    #[error("reply store {operation} failed: {reason}")]
    Store { operation: String, reason: String },

    /// A processing unit failed to build or execute.
    #[error("processing unit failed: {reason}")]
    Unit { reason: String },

    /// A lifecycle operation was called in the wrong state.
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    /// Configuration or other core failure.
    #[error(transparent)]
    Core(#[from] courier_core::Error),
}

impl Error {
    /// Create a dispatch error.
    pub fn dispatch(reason: impl Into<String>) -> Self {
        Self::Dispatch {
            reason: reason.into(),
        }
    }

    /// Create a store error.
    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a processing unit error.
    pub fn unit(reason: impl Into<String>) -> Self {
        Self::Unit {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation that produced this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueTimeout { .. } | Self::QueueFull { .. } | Self::PoolExhausted { .. }
        )
    }
}
