//! Ring-sharded priority queue
//!
//! A fixed ring of independent priority queues. A request is routed to
//! `hash(key) mod N` and ordered within its shard by priority, then arrival.
//! Each shard has its own lock and wake-up signal, so producers and the
//! per-shard assemblers only contend on the shard they touch.
//!
//! There is no ordering across shards: a high-priority request on one shard
//! may be sealed after a low-priority request on another. Deployments that
//! need a global order run a single shard.

use crate::batch::BudgetGate;
use crate::request::{RequestRecord, RequestState, StateCell};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use ringbatch_common::config::{AdmissionConfig, SchedulerConfig, ShardKeyPolicy};
use ringbatch_common::{RequestId, RingBatchError, Result, SamplingParams, METRICS};
use std::cmp::Ordering as CmpOrdering;
use std::collections::hash_map::DefaultHasher;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{error, trace};

/// Heap entry; the max-heap pops the lowest schedule key first
struct Queued(RequestRecord);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.id() == other.0.id()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.schedule_key().cmp(&self.0.schedule_key())
    }
}

#[derive(Default)]
struct ShardHeap {
    entries: BinaryHeap<Queued>,
    queued_tokens: usize,
}

#[derive(Default)]
struct Shard {
    heap: Mutex<ShardHeap>,
    depth: AtomicUsize,
    notify: Notify,
}

/// Fixed ring of per-shard priority queues
pub struct RingShardedQueue {
    shards: Vec<CachePadded<Shard>>,
    shard_key: ShardKeyPolicy,
    max_depth: Option<usize>,
    closed: AtomicBool,
}

impl RingShardedQueue {
    /// Create a new ring with `config.num_shards` shards
    pub fn new(config: &SchedulerConfig, admission: &AdmissionConfig) -> Self {
        let shards = (0..config.num_shards.max(1))
            .map(|_| CachePadded::new(Shard::default()))
            .collect();

        Self {
            shards,
            shard_key: config.shard_key,
            max_depth: admission.max_queue_depth,
            closed: AtomicBool::new(false),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, index: usize) -> Result<&Shard> {
        self.shards
            .get(index)
            .map(|shard| &**shard)
            .ok_or(RingBatchError::ShardUnavailable {
                shard: index,
                shards: self.shards.len(),
            })
    }

    /// Shard index for a request
    pub fn route(&self, id: RequestId, sampling: &SamplingParams) -> usize {
        let key = match self.shard_key {
            ShardKeyPolicy::RequestId => {
                let mut hasher = DefaultHasher::new();
                id.hash(&mut hasher);
                hasher.finish()
            }
            ShardKeyPolicy::SamplingParams => sampling.fingerprint(),
        };
        (key % self.shards.len() as u64) as usize
    }

    /// Insert a record into its shard. Never waits for capacity: a full shard
    /// rejects with `QueueSaturated`.
    pub fn enqueue(&self, record: RequestRecord) -> Result<usize> {
        if self.is_closed() {
            return Err(RingBatchError::shutting_down(format!(
                "queue closed, request {} not admitted",
                record.id()
            )));
        }

        let index = self.route(record.id(), &record.spec().sampling);
        let shard = self.shard(index)?;
        let id = record.id();

        {
            let mut heap = shard.heap.lock();
            if let Some(max_depth) = self.max_depth {
                if heap.entries.len() >= max_depth {
                    return Err(RingBatchError::queue_saturated(format!(
                        "shard {} holds {} requests, request {} rejected",
                        index,
                        heap.entries.len(),
                        id
                    )));
                }
            }
            heap.queued_tokens += record.cost();
            heap.entries.push(Queued(record));
            shard.depth.store(heap.entries.len(), Ordering::Relaxed);
        }

        METRICS.admission.queue_depth.inc();
        shard.notify.notify_one();
        trace!(request_id = id, shard = index, "Request enqueued");

        Ok(index)
    }

    /// Remove the longest prefix of the shard's order whose cumulative cost
    /// fits `budget`, up to `max_count` records. A head record costing more
    /// than the whole budget is returned alone. Drained records are `Batched`.
    pub fn dequeue_up_to(
        &self,
        shard_index: usize,
        budget: usize,
        max_count: usize,
    ) -> Result<Vec<RequestRecord>> {
        let shard = self.shard(shard_index)?;
        let mut gate = BudgetGate::new(budget, max_count);
        let mut taken = Vec::new();
        let mut popped = 0usize;

        {
            let mut heap = shard.heap.lock();
            loop {
                let cost = match heap.entries.peek() {
                    Some(head) if gate.admits(head.0.cost()) => head.0.cost(),
                    _ => break,
                };
                let Some(Queued(mut record)) = heap.entries.pop() else {
                    break;
                };
                heap.queued_tokens -= cost;
                popped += 1;

                if !record.transition(RequestState::Queued, RequestState::Batched) {
                    error!(
                        request_id = record.id(),
                        shard = shard_index,
                        state = ?record.state(),
                        "Queued record was not in Queued state"
                    );
                    record.resolve(Err(RingBatchError::internal(format!(
                        "request {} found in shard {} queue in state {:?}",
                        record.id(),
                        shard_index,
                        record.state()
                    ))));
                    continue;
                }

                gate.take(cost);
                taken.push(record);
            }
            shard.depth.store(heap.entries.len(), Ordering::Relaxed);
        }

        if popped > 0 {
            METRICS.admission.queue_depth.sub(popped as i64);
        }
        Ok(taken)
    }

    /// Withdraw a still-queued request. Returns the record if it was queued on
    /// this shard and is now `Cancelled`.
    pub fn cancel(
        &self,
        shard_index: usize,
        id: RequestId,
        state: &StateCell,
    ) -> Result<Option<RequestRecord>> {
        let shard = self.shard(shard_index)?;
        let mut heap = shard.heap.lock();

        // Under the shard lock no assembler can be draining this record.
        if !state.transition(RequestState::Queued, RequestState::Cancelled) {
            return Ok(None);
        }

        let entries = std::mem::take(&mut heap.entries).into_vec();
        let (mut removed, kept): (Vec<Queued>, Vec<Queued>) =
            entries.into_iter().partition(|entry| entry.0.id() == id);
        heap.entries = BinaryHeap::from(kept);
        shard.depth.store(heap.entries.len(), Ordering::Relaxed);

        match removed.pop() {
            Some(Queued(record)) => {
                heap.queued_tokens -= record.cost();
                METRICS.admission.queue_depth.dec();
                Ok(Some(record))
            }
            None => Err(RingBatchError::internal(format!(
                "request {} was Queued but absent from shard {}",
                id, shard_index
            ))),
        }
    }

    /// Wait until the shard is signalled or `wait` elapses
    pub async fn wait_for_work(&self, shard_index: usize, wait: Duration) -> Result<()> {
        let shard = self.shard(shard_index)?;
        let _ = timeout(wait, shard.notify.notified()).await;
        Ok(())
    }

    /// Requests queued on one shard
    pub fn depth(&self, shard_index: usize) -> Result<usize> {
        Ok(self.shard(shard_index)?.depth.load(Ordering::Relaxed))
    }

    /// Requests queued across the ring
    pub fn total_depth(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.depth.load(Ordering::Relaxed))
            .sum()
    }

    /// Cost of everything queued on one shard
    pub fn queued_tokens(&self, shard_index: usize) -> Result<usize> {
        Ok(self.shard(shard_index)?.heap.lock().queued_tokens)
    }

    /// Stop admitting and wake every waiting assembler
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for shard in &self.shards {
            shard.notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take everything still queued on a shard, in service order. Drained
    /// records leave the lock already `Cancelled`, so a racing `cancel` sees
    /// them as no longer queued.
    pub fn drain(&self, shard_index: usize) -> Result<Vec<RequestRecord>> {
        let shard = self.shard(shard_index)?;
        let mut heap = shard.heap.lock();

        let mut drained = Vec::with_capacity(heap.entries.len());
        while let Some(Queued(record)) = heap.entries.pop() {
            if !record.transition(RequestState::Queued, RequestState::Cancelled) {
                error!(
                    request_id = record.id(),
                    shard = shard_index,
                    state = ?record.state(),
                    "Drained record was not in Queued state"
                );
            }
            drained.push(record);
        }
        heap.queued_tokens = 0;
        shard.depth.store(0, Ordering::Relaxed);

        if !drained.is_empty() {
            METRICS.admission.queue_depth.sub(drained.len() as i64);
        }
        Ok(drained)
    }
}

impl std::fmt::Debug for RingShardedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingShardedQueue")
            .field("shards", &self.shards.len())
            .field("depth", &self.total_depth())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{GenerationResult, RequestSpec};
    use ringbatch_common::config::CostModel;
    use ringbatch_common::Priority;
    use tokio::sync::oneshot;

    fn queue(num_shards: usize, max_queue_depth: Option<usize>) -> RingShardedQueue {
        let config = SchedulerConfig {
            num_shards,
            ..Default::default()
        };
        let admission = AdmissionConfig {
            max_queue_depth,
            ..Default::default()
        };
        RingShardedQueue::new(&config, &admission)
    }

    fn record(
        id: RequestId,
        cost: usize,
        priority: Priority,
    ) -> (RequestRecord, oneshot::Receiver<GenerationResult>) {
        let (tx, rx) = oneshot::channel();
        let spec = RequestSpec::new(vec![7; cost], 1).with_priority(priority);
        (RequestRecord::new(id, spec, CostModel::PromptOnly, tx), rx)
    }

    fn ids(records: &[RequestRecord]) -> Vec<RequestId> {
        records.iter().map(RequestRecord::id).collect()
    }

    #[test]
    fn test_greedy_prefix_packing() {
        let queue = queue(1, None);
        for (id, cost) in [(1, 4), (2, 4), (3, 4), (4, 9)] {
            queue.enqueue(record(id, cost, Priority::NORMAL).0).unwrap();
        }

        assert_eq!(ids(&queue.dequeue_up_to(0, 10, 3).unwrap()), vec![1, 2]);
        assert_eq!(ids(&queue.dequeue_up_to(0, 10, 3).unwrap()), vec![3]);
        assert_eq!(ids(&queue.dequeue_up_to(0, 10, 3).unwrap()), vec![4]);
        assert!(queue.dequeue_up_to(0, 10, 3).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_request_dequeued_alone() {
        let queue = queue(1, None);
        queue.enqueue(record(1, 15, Priority::NORMAL).0).unwrap();
        queue.enqueue(record(2, 1, Priority::NORMAL).0).unwrap();

        let first = queue.dequeue_up_to(0, 10, 3).unwrap();
        assert_eq!(ids(&first), vec![1]);
        assert_eq!(first[0].state(), RequestState::Batched);

        assert_eq!(ids(&queue.dequeue_up_to(0, 10, 3).unwrap()), vec![2]);
    }

    #[test]
    fn test_priority_then_arrival_order() {
        let queue = queue(1, None);
        queue.enqueue(record(1, 1, Priority::LOW).0).unwrap();
        queue.enqueue(record(2, 1, Priority::NORMAL).0).unwrap();
        queue.enqueue(record(3, 1, Priority::HIGH).0).unwrap();
        queue.enqueue(record(4, 1, Priority::NORMAL).0).unwrap();

        let drained = queue.dequeue_up_to(0, 100, 10).unwrap();
        assert_eq!(ids(&drained), vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_max_count_cap() {
        let queue = queue(1, None);
        for id in 1..=5 {
            queue.enqueue(record(id, 1, Priority::NORMAL).0).unwrap();
        }

        assert_eq!(queue.dequeue_up_to(0, 100, 2).unwrap().len(), 2);
        assert_eq!(queue.depth(0).unwrap(), 3);
        assert_eq!(queue.queued_tokens(0).unwrap(), 3);
    }

    #[test]
    fn test_shard_out_of_range() {
        let queue = queue(2, None);
        let err = queue.dequeue_up_to(2, 10, 1).unwrap_err();
        assert!(matches!(
            err,
            RingBatchError::ShardUnavailable { shard: 2, shards: 2 }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_routing_is_deterministic() {
        let queue = queue(4, None);
        let sampling = SamplingParams::default();
        for id in 0..64 {
            let shard = queue.route(id, &sampling);
            assert!(shard < 4);
            assert_eq!(shard, queue.route(id, &sampling));
        }
    }

    #[test]
    fn test_sampling_params_routing_colocates() {
        let config = SchedulerConfig {
            num_shards: 8,
            shard_key: ShardKeyPolicy::SamplingParams,
            ..Default::default()
        };
        let queue = RingShardedQueue::new(&config, &AdmissionConfig::default());
        let sampling = SamplingParams {
            temperature: 0.7,
            ..Default::default()
        };

        let shard = queue.route(1, &sampling);
        assert!((2..50).all(|id| queue.route(id, &sampling) == shard));
    }

    #[test]
    fn test_saturation_rejects() {
        let queue = queue(1, Some(2));
        queue.enqueue(record(1, 1, Priority::NORMAL).0).unwrap();
        queue.enqueue(record(2, 1, Priority::NORMAL).0).unwrap();

        let err = queue.enqueue(record(3, 1, Priority::NORMAL).0).unwrap_err();
        assert!(matches!(err, RingBatchError::QueueSaturated(_)));
        assert_eq!(queue.depth(0).unwrap(), 2);
    }

    #[test]
    fn test_cancel_removes_queued_record() {
        let queue = queue(1, None);
        let (first, _rx1) = record(1, 1, Priority::NORMAL);
        let (second, _rx2) = record(2, 1, Priority::NORMAL);
        let state = second.state_cell();
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();

        let removed = queue.cancel(0, 2, &state).unwrap().unwrap();
        assert_eq!(removed.id(), 2);
        assert_eq!(state.get(), RequestState::Cancelled);
        assert_eq!(queue.depth(0).unwrap(), 1);

        // second attempt finds nothing to cancel
        assert!(queue.cancel(0, 2, &state).unwrap().is_none());
        assert_eq!(ids(&queue.dequeue_up_to(0, 10, 10).unwrap()), vec![1]);
    }

    #[test]
    fn test_cancel_after_drain_is_noop() {
        let queue = queue(1, None);
        let (first, _rx) = record(1, 1, Priority::NORMAL);
        let state = first.state_cell();
        queue.enqueue(first).unwrap();

        let drained = queue.dequeue_up_to(0, 10, 10).unwrap();
        assert_eq!(drained.len(), 1);
        assert!(queue.cancel(0, 1, &state).unwrap().is_none());
        assert_eq!(state.get(), RequestState::Batched);
    }

    #[test]
    fn test_close_and_drain() {
        let queue = queue(1, None);
        queue.enqueue(record(1, 1, Priority::LOW).0).unwrap();
        queue.enqueue(record(2, 1, Priority::HIGH).0).unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(record(3, 1, Priority::NORMAL).0),
            Err(RingBatchError::ShuttingDown(_))
        ));

        let drained = queue.drain(0).unwrap();
        assert_eq!(ids(&drained), vec![2, 1]);
        assert!(drained.iter().all(|r| r.state() == RequestState::Cancelled));
        assert_eq!(queue.total_depth(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_skips_record_in_wrong_state() {
        let queue = queue(1, None);
        let (stale, stale_rx) = record(1, 1, Priority::HIGH);
        let state = stale.state_cell();
        queue.enqueue(stale).unwrap();
        queue.enqueue(record(2, 1, Priority::NORMAL).0).unwrap();

        // state moved without the record leaving the heap
        assert!(state.transition(RequestState::Queued, RequestState::Cancelled));

        let taken = queue.dequeue_up_to(0, 10, 10).unwrap();
        assert_eq!(ids(&taken), vec![2]);
        assert_eq!(queue.depth(0).unwrap(), 0);
        assert_eq!(queue.queued_tokens(0).unwrap(), 0);
        assert!(matches!(
            stale_rx.await.unwrap(),
            Err(RingBatchError::Internal(_))
        ));
    }

    #[test]
    fn test_cancel_after_drain_at_shutdown() {
        let queue = queue(1, None);
        let (first, _rx) = record(1, 1, Priority::NORMAL);
        let state = first.state_cell();
        queue.enqueue(first).unwrap();
        queue.close();

        let drained = queue.drain(0).unwrap();
        assert_eq!(ids(&drained), vec![1]);
        assert!(queue.cancel(0, 1, &state).unwrap().is_none());
        assert_eq!(state.get(), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_for_work_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(queue(1, None));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let start = std::time::Instant::now();
                queue.wait_for_work(0, Duration::from_secs(10)).await.unwrap();
                start.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(record(1, 1, Priority::NORMAL).0).unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(10));
    }
}
