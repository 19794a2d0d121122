//! Worker availability gate
//!
//! A counting semaphore bounds how many batches execute at once, and an
//! explicit free-list says which worker a granted permit maps to. Release
//! returns the worker to the free-list before the permit, so a task that
//! wins a permit always finds a worker waiting for it.

use parking_lot::Mutex;
use ringbatch_common::{BatchId, RingBatchError, Result, WorkerId, METRICS};
use ringbatch_worker::WorkerShard;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Exclusive right to one worker shard
#[derive(Debug)]
pub struct WorkerLease {
    worker_id: WorkerId,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }
}

/// Fixed set of worker shards with acquire/release semantics
pub struct WorkerPool {
    gate: Arc<Semaphore>,
    free: Mutex<VecDeque<WorkerId>>,
    assignments: Mutex<HashMap<WorkerId, BatchId>>,
    shards: Vec<Arc<Mutex<WorkerShard>>>,
}

impl WorkerPool {
    /// Create a pool; shard ids must be exactly `0..shards.len()`
    pub fn new(mut shards: Vec<WorkerShard>) -> Result<Self> {
        if shards.is_empty() {
            return Err(RingBatchError::config("worker pool needs at least one shard"));
        }
        shards.sort_by_key(WorkerShard::id);
        if let Some((index, shard)) = shards
            .iter()
            .enumerate()
            .find(|(index, shard)| shard.id() != *index)
        {
            return Err(RingBatchError::config(format!(
                "worker shard ids must be 0..{}, found id {} at position {}",
                shards.len(),
                shard.id(),
                index
            )));
        }

        let size = shards.len();
        Ok(Self {
            gate: Arc::new(Semaphore::new(size)),
            free: Mutex::new((0..size).collect()),
            assignments: Mutex::new(HashMap::new()),
            shards: shards
                .into_iter()
                .map(|shard| Arc::new(Mutex::new(shard)))
                .collect(),
        })
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// Workers not currently holding a batch
    pub fn available(&self) -> usize {
        self.gate.available_permits()
    }

    /// Wait for a free worker
    pub async fn acquire(&self) -> Result<WorkerLease> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| RingBatchError::shutting_down("worker pool closed"))?;

        let worker_id = self.free.lock().pop_front().ok_or_else(|| {
            RingBatchError::internal("worker permit granted with an empty free-list")
        })?;

        METRICS.dispatch.busy_workers.inc();
        trace!(worker = worker_id, "Worker acquired");
        Ok(WorkerLease {
            worker_id,
            _permit: permit,
        })
    }

    /// Record which batch a leased worker is running
    pub fn assign(&self, lease: &WorkerLease, batch_id: BatchId) -> Result<()> {
        let mut assignments = self.assignments.lock();
        if let Some(current) = assignments.get(&lease.worker_id) {
            return Err(RingBatchError::internal(format!(
                "worker {} already runs batch {}, cannot take batch {}",
                lease.worker_id, current, batch_id
            )));
        }
        assignments.insert(lease.worker_id, batch_id);
        Ok(())
    }

    /// Batch currently assigned to a worker
    pub fn assignment(&self, worker_id: WorkerId) -> Option<BatchId> {
        self.assignments.lock().get(&worker_id).copied()
    }

    /// Return a worker to the pool
    pub fn release(&self, lease: WorkerLease) {
        self.assignments.lock().remove(&lease.worker_id);
        self.free.lock().push_back(lease.worker_id);
        METRICS.dispatch.busy_workers.dec();
        trace!(worker = lease.worker_id, "Worker released");
        // permit drops last
        drop(lease);
    }

    pub(crate) fn shard(&self, worker_id: WorkerId) -> Result<Arc<Mutex<WorkerShard>>> {
        self.shards.get(worker_id).cloned().ok_or_else(|| {
            RingBatchError::internal(format!(
                "worker {} outside pool of {}",
                worker_id,
                self.shards.len()
            ))
        })
    }

    /// Fail every pending and future acquire
    pub fn close(&self) {
        self.gate.close();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.shards.len())
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbatch_worker::SimulatedBackend;
    use std::time::Duration;

    fn pool(size: usize) -> WorkerPool {
        WorkerPool::new(WorkerShard::build_pool(size, |_| {
            Box::new(SimulatedBackend::new())
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = pool(2);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_ne!(first.worker_id(), second.worker_id());
        assert_eq!(pool.available(), 0);

        pool.assign(&first, 11).unwrap();
        assert_eq!(pool.assignment(first.worker_id()), Some(11));
        assert!(pool.assign(&first, 12).is_err());

        let released = first.worker_id();
        pool.release(first);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.assignment(released), None);

        let third = pool.acquire().await.unwrap();
        assert_eq!(third.worker_id(), released);
        pool.release(second);
        pool.release(third);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let pool = Arc::new(pool(1));
        let lease = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| lease.worker_id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(lease);
        assert_eq!(waiter.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_acquire() {
        let pool = pool(1);
        pool.close();
        assert!(matches!(
            pool.acquire().await,
            Err(RingBatchError::ShuttingDown(_))
        ));
    }

    #[test]
    fn test_rejects_bad_shard_ids() {
        let shards = vec![
            WorkerShard::new(0, Box::new(SimulatedBackend::new())),
            WorkerShard::new(2, Box::new(SimulatedBackend::new())),
        ];
        assert!(WorkerPool::new(shards).is_err());
        assert!(WorkerPool::new(Vec::new()).is_err());
    }
}
