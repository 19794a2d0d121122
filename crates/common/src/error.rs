//! Common error types for RingBatch
//!
//! This module defines all error types used across the scheduler, the worker
//! shards and the admission layer. Every error maps to a gRPC status code so
//! the transport in front of the scheduler can surface it unchanged.

use thiserror::Error;

/// Main error type for RingBatch
#[derive(Error, Debug)]
pub enum RingBatchError {
    /// Malformed request, rejected before it enters any queue
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Routing produced a shard index outside the ring
    #[error("Shard {shard} unavailable (ring has {shards} shards)")]
    ShardUnavailable { shard: usize, shards: usize },

    /// A worker shard failed while executing a batch
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// A worker reported a failure for a single request
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Request withdrawn before dispatch
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Shard queue is at its depth ceiling (backpressure)
    #[error("Queue saturated: {0}")]
    QueueSaturated(String),

    /// Scheduler stopped before the request was dispatched
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration source errors (file or environment layering)
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registration or encoding errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Impossible state reached
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RingBatchError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            RingBatchError::InvalidRequest(msg) => {
                tonic::Status::invalid_argument(format!("Invalid request: {}", msg))
            }
            RingBatchError::ShardUnavailable { .. } => tonic::Status::internal(self.to_string()),
            RingBatchError::WorkerUnavailable(msg) => {
                tonic::Status::unavailable(format!("Worker unavailable: {}", msg))
            }
            RingBatchError::Execution(msg) => {
                tonic::Status::internal(format!("Execution failed: {}", msg))
            }
            RingBatchError::Cancelled(msg) => {
                tonic::Status::cancelled(format!("Request cancelled: {}", msg))
            }
            RingBatchError::QueueSaturated(msg) => {
                tonic::Status::resource_exhausted(format!("Queue saturated: {}", msg))
            }
            RingBatchError::ShuttingDown(msg) => {
                tonic::Status::unavailable(format!("Shutting down: {}", msg))
            }
            RingBatchError::Config(msg) => {
                tonic::Status::internal(format!("Configuration error: {}", msg))
            }
            RingBatchError::ConfigSource(err) => {
                tonic::Status::internal(format!("Configuration source error: {}", err))
            }
            RingBatchError::Serialization(err) => {
                tonic::Status::internal(format!("Serialization error: {}", err))
            }
            RingBatchError::Io(err) => tonic::Status::internal(format!("I/O error: {}", err)),
            RingBatchError::Metrics(err) => {
                tonic::Status::internal(format!("Metrics error: {}", err))
            }
            RingBatchError::Internal(msg) => {
                tonic::Status::internal(format!("Internal error: {}", msg))
            }
        }
    }

    /// Invariant violations that must halt the affected loop
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RingBatchError::ShardUnavailable { .. } | RingBatchError::Internal(_)
        )
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        RingBatchError::InvalidRequest(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        RingBatchError::WorkerUnavailable(msg.into())
    }

    /// Create a per-request execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        RingBatchError::Execution(msg.into())
    }

    /// Create a cancelled error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        RingBatchError::Cancelled(msg.into())
    }

    /// Create a queue saturated error
    pub fn queue_saturated(msg: impl Into<String>) -> Self {
        RingBatchError::QueueSaturated(msg.into())
    }

    /// Create a shutting down error
    pub fn shutting_down(msg: impl Into<String>) -> Self {
        RingBatchError::ShuttingDown(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RingBatchError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        RingBatchError::Internal(msg.into())
    }
}

/// Result type alias for RingBatch operations
pub type Result<T> = std::result::Result<T, RingBatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RingBatchError::invalid_request("empty prompt").to_status().code(),
            tonic::Code::InvalidArgument
        );
        assert_eq!(
            RingBatchError::queue_saturated("shard 0").to_status().code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            RingBatchError::cancelled("request 7").to_status().code(),
            tonic::Code::Cancelled
        );
        assert_eq!(
            RingBatchError::worker_unavailable("worker 1").to_status().code(),
            tonic::Code::Unavailable
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RingBatchError::ShardUnavailable { shard: 9, shards: 4 }.is_fatal());
        assert!(RingBatchError::internal("double dispatch").is_fatal());
        assert!(!RingBatchError::worker_unavailable("crash").is_fatal());
        assert!(!RingBatchError::queue_saturated("full").is_fatal());
    }

    #[test]
    fn test_shard_unavailable_message() {
        let err = RingBatchError::ShardUnavailable { shard: 5, shards: 4 };
        assert_eq!(err.to_string(), "Shard 5 unavailable (ring has 4 shards)");
    }
}
