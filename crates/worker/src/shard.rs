//! Worker shard execution unit

use crate::backend::{BatchOutput, ExecutionBackend, ExecutionBatch};
use ringbatch_common::metrics::LatencyTimer;
use ringbatch_common::{RingBatchError, Result, WorkerId, METRICS};
use std::time::Instant;
use tracing::{debug, warn};

/// One execution unit of the worker pool
///
/// Wraps a backend with its pool index and times every batch it runs.
pub struct WorkerShard {
    id: WorkerId,
    backend: Box<dyn ExecutionBackend>,
    batches_executed: u64,
}

impl WorkerShard {
    /// Create a new worker shard
    pub fn new(id: WorkerId, backend: Box<dyn ExecutionBackend>) -> Self {
        Self {
            id,
            backend,
            batches_executed: 0,
        }
    }

    /// Build `count` shards, asking `factory` for each backend
    pub fn build_pool<F>(count: usize, mut factory: F) -> Vec<WorkerShard>
    where
        F: FnMut(WorkerId) -> Box<dyn ExecutionBackend>,
    {
        (0..count).map(|id| WorkerShard::new(id, factory(id))).collect()
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn batches_executed(&self) -> u64 {
        self.batches_executed
    }

    /// Execute a batch on this shard
    pub fn execute(&mut self, batch: &ExecutionBatch) -> Result<BatchOutput> {
        if batch.worker_id != self.id {
            return Err(RingBatchError::internal(format!(
                "batch {} assigned to worker {} was handed to worker {}",
                batch.batch_id, batch.worker_id, self.id
            )));
        }

        let start = Instant::now();
        let backend = &mut self.backend;
        let result = METRICS
            .dispatch
            .execution_duration
            .time(|| backend.execute(batch));
        self.batches_executed += 1;

        match &result {
            Ok(output) => debug!(
                worker = self.id,
                batch_id = batch.batch_id,
                members = batch.len(),
                outcomes = output.outcomes.len(),
                "Executed batch in {:?}",
                start.elapsed()
            ),
            Err(e) => warn!(
                worker = self.id,
                batch_id = batch.batch_id,
                "Batch execution failed after {:?}: {}",
                start.elapsed(),
                e
            ),
        }

        result
    }
}

impl std::fmt::Debug for WorkerShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerShard")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("batches_executed", &self.batches_executed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedBackend;
    use ringbatch_common::{SamplingParams, WorkItem};

    fn batch_for(worker_id: WorkerId) -> ExecutionBatch {
        ExecutionBatch {
            batch_id: 1,
            worker_id,
            items: vec![WorkItem {
                request_id: 10,
                tokens: vec![1, 2, 3],
                min_tokens: 2,
                max_tokens: 2,
                sampling: SamplingParams::default(),
            }],
        }
    }

    #[test]
    fn test_shard_executes_batch() {
        let mut shards =
            WorkerShard::build_pool(2, |_| Box::new(SimulatedBackend::new()) as Box<dyn ExecutionBackend>);
        let shard = &mut shards[1];

        let output = shard.execute(&batch_for(1)).unwrap();
        assert_eq!(output.outcomes.len(), 1);
        assert_eq!(shard.batches_executed(), 1);
        assert_eq!(shard.backend_name(), "simulated");
    }

    #[test]
    fn test_shard_rejects_foreign_batch() {
        let mut shard = WorkerShard::new(0, Box::new(SimulatedBackend::new()));
        let err = shard.execute(&batch_for(3)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(shard.batches_executed(), 0);
    }
}
