//! Batch assembler loop
//!
//! One assembler runs per ring shard. Each tick drains a token-bounded prefix
//! of the shard's queue, seals it, and submits it to the dispatch coordinator.
//! Submit blocks while every worker is busy, which is where backpressure
//! reaches the queues.

use crate::batch::{OpenBatch, SealedBatch};
use crate::dispatch::DispatchCoordinator;
use crate::queue::RingShardedQueue;
use ringbatch_common::config::SchedulerConfig;
use ringbatch_common::{RingBatchError, Result, METRICS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Assembly loop for one ring shard
pub struct BatchAssembler {
    shard: usize,
    queue: Arc<RingShardedQueue>,
    dispatcher: Arc<DispatchCoordinator>,
    config: SchedulerConfig,
    batch_ids: Arc<AtomicU64>,
}

impl BatchAssembler {
    pub fn new(
        shard: usize,
        queue: Arc<RingShardedQueue>,
        dispatcher: Arc<DispatchCoordinator>,
        config: SchedulerConfig,
        batch_ids: Arc<AtomicU64>,
    ) -> Self {
        Self {
            shard,
            queue,
            dispatcher,
            config,
            batch_ids,
        }
    }

    /// Run the loop on the runtime
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Drain, seal and submit until the queue closes.
    ///
    /// Fatal errors halt this shard's loop and are returned; anything else is
    /// logged and the loop carries on.
    pub async fn run(self) -> Result<()> {
        info!(shard = self.shard, "Starting batch assembler");
        let mut backoff = self.config.backoff();

        while !self.queue.is_closed() {
            match self.assemble_once() {
                Ok(Some(batch)) => {
                    backoff = self.config.backoff();
                    match self.dispatcher.submit(batch).await {
                        Ok(()) => {}
                        Err(RingBatchError::ShuttingDown(_)) => break,
                        Err(e) if e.is_fatal() => {
                            error!(shard = self.shard, "Halting batch assembler: {}", e);
                            return Err(e);
                        }
                        Err(e) => warn!(shard = self.shard, "Batch submit failed: {}", e),
                    }
                }
                Ok(None) => {
                    self.queue.wait_for_work(self.shard, backoff).await?;
                    backoff = (backoff * 2).min(self.config.max_backoff());
                }
                Err(e) if e.is_fatal() => {
                    error!(shard = self.shard, "Halting batch assembler: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(shard = self.shard, "Batch assembly failed: {}", e);
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        info!(shard = self.shard, "Batch assembler stopped");
        Ok(())
    }

    /// One scheduling tick: drain the shard and seal what came out
    pub fn assemble_once(&self) -> Result<Option<SealedBatch>> {
        let records = self.queue.dequeue_up_to(
            self.shard,
            self.config.max_batch_tokens,
            self.config.max_batch_size,
        )?;
        if records.is_empty() {
            return Ok(None);
        }

        let batch_id = self.batch_ids.fetch_add(1, Ordering::Relaxed);
        let mut batch = OpenBatch::new(
            batch_id,
            self.shard,
            self.config.max_batch_tokens,
            self.config.max_batch_size,
        );
        let batching = &METRICS.batching;
        for record in records {
            batching
                .queue_wait
                .observe(record.arrival_time().elapsed().as_secs_f64());
            batch.push(record);
        }

        let sealed = batch.seal();
        batching.batches_sealed.inc();
        batching.batch_size.observe(sealed.len() as f64);
        batching
            .batch_tokens
            .observe(sealed.token_budget_used() as f64);
        if sealed.is_oversized() {
            batching.oversized_batches.inc();
            warn!(
                batch_id,
                shard = self.shard,
                cost = sealed.token_budget_used(),
                budget = self.config.max_batch_tokens,
                "Sealed oversized request as its own batch"
            );
        }

        debug!(
            batch_id,
            shard = self.shard,
            members = sealed.len(),
            tokens = sealed.token_budget_used(),
            "Sealed batch"
        );
        Ok(Some(sealed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use crate::request::{GenerationResult, RequestRecord, RequestSpec, RequestState};
    use ringbatch_common::config::{AdmissionConfig, CostModel};
    use ringbatch_common::{Priority, RequestId};
    use ringbatch_worker::{SimulatedBackend, WorkerShard};
    use std::collections::HashSet;
    use tokio::sync::oneshot;

    fn assembler(budget: usize, max_members: usize, shards: usize) -> BatchAssembler {
        let config = SchedulerConfig {
            max_batch_tokens: budget,
            max_batch_size: max_members,
            num_shards: shards,
            cost_model: CostModel::PromptOnly,
            ..Default::default()
        };
        let queue = Arc::new(RingShardedQueue::new(&config, &AdmissionConfig::default()));
        let pool = WorkerPool::new(WorkerShard::build_pool(1, |_| {
            Box::new(SimulatedBackend::new())
        }))
        .unwrap();
        BatchAssembler::new(
            0,
            queue,
            Arc::new(DispatchCoordinator::new(pool)),
            config,
            Arc::new(AtomicU64::new(1)),
        )
    }

    fn enqueue(
        assembler: &BatchAssembler,
        id: RequestId,
        cost: usize,
        priority: Priority,
    ) -> oneshot::Receiver<GenerationResult> {
        let (tx, rx) = oneshot::channel();
        let spec = RequestSpec::new(vec![3; cost], 1).with_priority(priority);
        assembler
            .queue
            .enqueue(RequestRecord::new(id, spec, CostModel::PromptOnly, tx))
            .unwrap();
        rx
    }

    fn drain_all(assembler: &BatchAssembler) -> Vec<SealedBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = assembler.assemble_once().unwrap() {
            batches.push(batch);
        }
        batches
    }

    #[test]
    fn test_greedy_packing_scenario() {
        let assembler = assembler(10, 3, 1);
        let _rx: Vec<_> = [(1, 4), (2, 4), (3, 4), (4, 9)]
            .into_iter()
            .map(|(id, cost)| enqueue(&assembler, id, cost, Priority::NORMAL))
            .collect();

        let batches = drain_all(&assembler);
        let members: Vec<Vec<RequestId>> = batches.iter().map(SealedBatch::member_ids).collect();
        assert_eq!(members, vec![vec![1, 2], vec![3], vec![4]]);
        assert_eq!(batches[0].token_budget_used(), 8);
        assert!(batches.iter().all(|b| b.member_ids().len() <= 3));
        assert!(batches
            .iter()
            .flat_map(SealedBatch::members)
            .all(|r| r.state() == RequestState::Batched));
    }

    #[test]
    fn test_oversized_request_sealed_alone() {
        let assembler = assembler(10, 3, 1);
        let _rx = enqueue(&assembler, 1, 15, Priority::NORMAL);

        let batch = assembler.assemble_once().unwrap().unwrap();
        assert_eq!(batch.member_ids(), vec![1]);
        assert!(batch.is_oversized());
        assert!(assembler.assemble_once().unwrap().is_none());
    }

    #[test]
    fn test_equal_priority_earlier_arrival_first() {
        let assembler = assembler(4, 1, 1);
        let _a = enqueue(&assembler, 1, 2, Priority::NORMAL);
        let _b = enqueue(&assembler, 2, 2, Priority::NORMAL);

        let batches = drain_all(&assembler);
        assert_eq!(batches[0].member_ids(), vec![1]);
        assert_eq!(batches[1].member_ids(), vec![2]);
        assert!(batches[0].batch_id() < batches[1].batch_id());
    }

    #[test]
    fn test_batches_respect_budget_and_order() {
        let assembler = assembler(16, 4, 1);
        let priorities = [Priority::LOW, Priority::NORMAL, Priority::HIGH];
        let mut receivers = Vec::new();
        for id in 0..60u64 {
            let cost = 1 + (id as usize * 7) % 11;
            let priority = priorities[(id % 3) as usize];
            receivers.push(enqueue(&assembler, id, cost, priority));
        }

        let batches = drain_all(&assembler);
        let mut seen = HashSet::new();
        let mut last_priority = Priority::HIGH;
        for batch in &batches {
            assert!(batch.len() <= 4);
            assert!(batch.token_budget_used() <= 16 || (batch.is_oversized() && batch.len() == 1));
            for record in batch.members() {
                assert!(seen.insert(record.id()), "request {} sealed twice", record.id());
                assert!(record.priority() >= last_priority);
                last_priority = record.priority();
            }
        }
        assert_eq!(seen.len(), 60);
    }

    #[test]
    fn test_fatal_error_on_missing_shard() {
        let mut assembler = assembler(10, 3, 1);
        assembler.shard = 7;
        let err = assembler.assemble_once().unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_run_halts_on_fatal_error() {
        let mut assembler = assembler(10, 3, 1);
        assembler.shard = 3;
        let result = assembler.spawn().await.unwrap();
        assert!(matches!(
            result,
            Err(RingBatchError::ShardUnavailable { shard: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_run_exits_when_queue_closes() {
        let assembler = assembler(10, 3, 1);
        let queue = assembler.queue.clone();
        let handle = assembler.spawn();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.close();
        assert!(handle.await.unwrap().is_ok());
    }
}
