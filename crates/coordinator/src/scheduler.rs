//! Scheduler facade
//!
//! Owns the ring of shard queues, the dispatch coordinator and one batch
//! assembler per ring shard. Producers call `admit` from any task; the
//! returned handle resolves exactly once.

use crate::assembler::BatchAssembler;
use crate::dispatch::DispatchCoordinator;
use crate::pool::WorkerPool;
use crate::queue::RingShardedQueue;
use crate::request::{CancelToken, RequestHandle, RequestRecord, RequestSpec, RequestState};
use parking_lot::Mutex;
use ringbatch_common::{RingBatchConfig, RingBatchError, Result, METRICS};
use ringbatch_worker::WorkerShard;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Priority-queue-backed dynamic batching scheduler
pub struct Scheduler {
    config: RingBatchConfig,
    queue: Arc<RingShardedQueue>,
    dispatcher: Arc<DispatchCoordinator>,
    next_request_id: AtomicU64,
    batch_ids: Arc<AtomicU64>,
    assemblers: Mutex<Vec<JoinHandle<Result<()>>>>,
}

impl Scheduler {
    /// Build the scheduler over a fixed set of worker shards
    pub fn new(config: RingBatchConfig, shards: Vec<WorkerShard>) -> Result<Arc<Self>> {
        config.validate()?;
        if shards.len() != config.workers.num_workers {
            warn!(
                configured = config.workers.num_workers,
                provided = shards.len(),
                "Worker shard count differs from configuration"
            );
        }

        let queue = Arc::new(RingShardedQueue::new(&config.scheduler, &config.admission));
        let dispatcher = Arc::new(DispatchCoordinator::new(WorkerPool::new(shards)?));

        info!(
            shards = queue.shard_count(),
            workers = dispatcher.pool().size(),
            max_batch_tokens = config.scheduler.max_batch_tokens,
            max_batch_size = config.scheduler.max_batch_size,
            "Scheduler created"
        );

        Ok(Arc::new(Self {
            config,
            queue,
            dispatcher,
            next_request_id: AtomicU64::new(1),
            batch_ids: Arc::new(AtomicU64::new(1)),
            assemblers: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn one assembler loop per ring shard. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut assemblers = self.assemblers.lock();
        if !assemblers.is_empty() {
            return;
        }
        for shard in 0..self.queue.shard_count() {
            let assembler = BatchAssembler::new(
                shard,
                Arc::clone(&self.queue),
                Arc::clone(&self.dispatcher),
                self.config.scheduler.clone(),
                Arc::clone(&self.batch_ids),
            );
            assemblers.push(assembler.spawn());
        }
        info!(assemblers = assemblers.len(), "Scheduler started");
    }

    /// Validate and enqueue a request
    pub fn admit(&self, spec: RequestSpec) -> Result<RequestHandle> {
        let admission = &METRICS.admission;
        if let Err(e) = spec.validate(&self.config.admission) {
            admission
                .requests_rejected
                .with_label_values(&["invalid"])
                .inc();
            return Err(e);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let record = RequestRecord::new(id, spec, self.config.scheduler.cost_model, tx);
        let state = record.state_cell();
        let priority = record.priority();
        let cost = record.cost();

        let shard = match self.queue.enqueue(record) {
            Ok(shard) => shard,
            Err(e) => {
                let reason = match &e {
                    RingBatchError::QueueSaturated(_) => "saturated",
                    RingBatchError::ShuttingDown(_) => "shutting_down",
                    _ => "internal",
                };
                admission.requests_rejected.with_label_values(&[reason]).inc();
                return Err(e);
            }
        };

        admission.requests_admitted.inc();
        debug!(request_id = id, shard, %priority, cost, "Request admitted");
        Ok(RequestHandle::new(id, shard, state, rx))
    }

    /// Withdraw a request that has not been dispatched yet.
    ///
    /// Returns `false` when the request was already dispatched or finished.
    pub fn cancel(&self, token: &CancelToken) -> Result<bool> {
        if let Some(mut record) = self.queue.cancel(token.shard, token.id, &token.state)? {
            record.resolve(Err(RingBatchError::cancelled(format!(
                "request {} cancelled while queued on shard {}",
                token.id, token.shard
            ))));
            debug!(request_id = token.id, shard = token.shard, "Cancelled queued request");
            return Ok(true);
        }

        // The dispatcher resolves it when the batch reaches a worker.
        if token
            .state
            .transition(RequestState::Batched, RequestState::Cancelled)
        {
            debug!(request_id = token.id, "Cancelled batched request");
            return Ok(true);
        }

        Ok(false)
    }

    /// Requests queued across the ring
    pub fn queue_depth(&self) -> usize {
        self.queue.total_depth()
    }

    pub fn shard_depth(&self, shard: usize) -> Result<usize> {
        self.queue.depth(shard)
    }

    pub fn shard_count(&self) -> usize {
        self.queue.shard_count()
    }

    pub fn available_workers(&self) -> usize {
        self.dispatcher.available_workers()
    }

    pub fn in_flight_batches(&self) -> usize {
        self.dispatcher.in_flight_batches()
    }

    pub fn config(&self) -> &RingBatchConfig {
        &self.config
    }

    /// Stop admitting, stop the assemblers and resolve everything still queued.
    ///
    /// Batches already running on a worker finish and resolve normally.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down scheduler");
        self.queue.close();
        self.dispatcher.pool().close();

        let assemblers = std::mem::take(&mut *self.assemblers.lock());
        let mut first_error = None;
        for handle in assemblers {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Batch assembler exited with error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Batch assembler task failed: {}", e);
                    first_error.get_or_insert(RingBatchError::internal(format!(
                        "batch assembler task failed: {}",
                        e
                    )));
                }
            }
        }

        let mut drained = 0usize;
        for shard in 0..self.queue.shard_count() {
            for mut record in self.queue.drain(shard)? {
                let id = record.id();
                drained += 1;
                record.resolve(Err(RingBatchError::shutting_down(format!(
                    "request {} still queued on shard {} at shutdown",
                    id, shard
                ))));
            }
        }

        info!(drained, "Scheduler stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("workers", self.dispatcher.pool())
            .finish()
    }
}
