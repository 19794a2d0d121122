//! Execution backend boundary
//!
//! A backend runs one batch to completion and reports an outcome per member.
//! Failing the whole call means the shard itself is gone; failing one entry
//! only affects that request.

use ringbatch_common::{BatchId, Generation, RequestId, Result, WorkItem, WorkerId};

/// Per-request outcome; the error carries the backend's failure detail
pub type RequestOutcome = std::result::Result<Generation, String>;

/// Work handed to a worker shard
#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    pub batch_id: BatchId,
    pub worker_id: WorkerId,
    pub items: Vec<WorkItem>,
}

impl ExecutionBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Prompt tokens across all members
    pub fn prompt_tokens(&self) -> usize {
        self.items.iter().map(|item| item.tokens.len()).sum()
    }
}

/// Results of one executed batch
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub batch_id: BatchId,
    pub outcomes: Vec<(RequestId, RequestOutcome)>,
}

impl BatchOutput {
    pub fn new(batch_id: BatchId) -> Self {
        Self {
            batch_id,
            outcomes: Vec::new(),
        }
    }

    pub fn push(&mut self, request_id: RequestId, outcome: RequestOutcome) {
        self.outcomes.push((request_id, outcome));
    }
}

/// Generation backend driven by one worker shard
///
/// `execute` is synchronous: it is CPU/GPU-bound and runs on a blocking
/// thread, one batch at a time per shard.
pub trait ExecutionBackend: Send + 'static {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Run the batch to completion
    fn execute(&mut self, batch: &ExecutionBatch) -> Result<BatchOutput>;
}
