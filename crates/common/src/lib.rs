//! RingBatch common library
//!
//! This crate contains shared code used across RingBatch components.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

// Re-export commonly used types
pub use config::RingBatchConfig;
pub use error::{RingBatchError, Result};
pub use metrics::{MetricsRegistry, METRICS};
pub use types::{
    BatchId, Generation, Priority, RequestId, SamplingParams, TokenId, WorkItem, WorkerId,
};
