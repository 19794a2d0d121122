//! Dispatch coordinator
//!
//! Matches sealed batches to free worker shards, tracks the single in-flight
//! batch of each worker, and fans results back out to the per-request result
//! channels. A worker goes back to the pool only after every member of its
//! batch has been resolved.

use crate::batch::SealedBatch;
use crate::pool::{WorkerLease, WorkerPool};
use crate::request::{RequestRecord, RequestState};
use parking_lot::Mutex;
use ringbatch_common::{BatchId, RequestId, RingBatchError, Result, METRICS};
use ringbatch_worker::{BatchOutput, ExecutionBatch, RequestOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

struct InFlight {
    lease: WorkerLease,
    members: Vec<RequestRecord>,
    dispatched_at: Instant,
}

/// Assigns batches to workers and resolves their results
pub struct DispatchCoordinator {
    pool: WorkerPool,
    in_flight: Mutex<HashMap<BatchId, InFlight>>,
}

impl DispatchCoordinator {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Workers free to take a batch right now
    pub fn available_workers(&self) -> usize {
        self.pool.available()
    }

    /// Batches currently executing
    pub fn in_flight_batches(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Hand a sealed batch to a worker, waiting until one is free.
    ///
    /// Returns once the batch is running; results are resolved as the worker
    /// finishes. Members cancelled while `Batched` are resolved here and left
    /// out of the work sent to the worker.
    pub async fn submit(self: &Arc<Self>, batch: SealedBatch) -> Result<()> {
        let batch_id = batch.batch_id();
        let wait_start = Instant::now();

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                for mut member in batch.into_members() {
                    if member.transition(RequestState::Batched, RequestState::Cancelled) {
                        member.resolve(Err(RingBatchError::shutting_down(format!(
                            "request {} in batch {} was never dispatched: {}",
                            member.id(),
                            batch_id,
                            e
                        ))));
                    } else {
                        resolve_cancelled(&mut member, batch_id);
                    }
                }
                return Err(e);
            }
        };
        METRICS
            .dispatch
            .submit_wait
            .observe(wait_start.elapsed().as_secs_f64());

        let worker_id = lease.worker_id();
        let mut members = Vec::with_capacity(batch.len());
        let mut items = Vec::with_capacity(batch.len());
        for mut member in batch.into_members() {
            if member.transition(RequestState::Batched, RequestState::Dispatched) {
                items.push(member.to_work_item());
                members.push(member);
            } else {
                resolve_cancelled(&mut member, batch_id);
            }
        }

        if members.is_empty() {
            debug!(batch_id, "Every member was cancelled, batch not executed");
            self.pool.release(lease);
            return Ok(());
        }

        let shard = match self
            .pool
            .shard(worker_id)
            .and_then(|shard| self.pool.assign(&lease, batch_id).map(|_| shard))
        {
            Ok(shard) => shard,
            Err(e) => {
                error!(batch_id, worker = worker_id, "Cannot assign batch: {}", e);
                fail_all(members, |id| {
                    RingBatchError::internal(format!(
                        "request {} in batch {} could not be assigned to worker {}: {}",
                        id, batch_id, worker_id, e
                    ))
                });
                self.pool.release(lease);
                return Err(e);
            }
        };

        let work = ExecutionBatch {
            batch_id,
            worker_id,
            items,
        };
        info!(
            batch_id,
            worker = worker_id,
            members = members.len(),
            "Dispatched batch"
        );

        self.in_flight.lock().insert(
            batch_id,
            InFlight {
                lease,
                members,
                dispatched_at: Instant::now(),
            },
        );
        METRICS.dispatch.in_flight_batches.inc();

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let executed =
                tokio::task::spawn_blocking(move || shard.lock().execute(&work)).await;

            let resolution = match executed {
                Ok(Ok(output)) => coordinator.on_complete(batch_id, output),
                Ok(Err(e)) => coordinator.on_worker_error(batch_id, e),
                Err(join_error) => coordinator.on_worker_error(
                    batch_id,
                    RingBatchError::worker_unavailable(format!(
                        "worker {} aborted: {}",
                        worker_id, join_error
                    )),
                ),
            };
            if let Err(e) = resolution {
                error!(batch_id, "Failed to resolve batch: {}", e);
            }
        });

        Ok(())
    }

    fn take_in_flight(&self, batch_id: BatchId) -> Result<InFlight> {
        let flight = self.in_flight.lock().remove(&batch_id).ok_or_else(|| {
            RingBatchError::internal(format!("no in-flight batch with id {}", batch_id))
        })?;
        METRICS.dispatch.in_flight_batches.dec();
        Ok(flight)
    }

    /// Resolve every member of a finished batch with its own outcome
    pub fn on_complete(&self, batch_id: BatchId, output: BatchOutput) -> Result<()> {
        let flight = self.take_in_flight(batch_id)?;
        let worker_id = flight.lease.worker_id();
        if output.batch_id != batch_id {
            warn!(
                batch_id,
                reported = output.batch_id,
                "Worker reported results under a different batch id"
            );
        }

        let mut outcomes: HashMap<RequestId, RequestOutcome> =
            output.outcomes.into_iter().collect();
        let mut completed = 0usize;

        for mut member in flight.members {
            let id = member.id();
            match outcomes.remove(&id) {
                Some(Ok(generation)) => {
                    member.transition(RequestState::Dispatched, RequestState::Completed);
                    member.resolve(Ok(generation));
                    completed += 1;
                }
                Some(Err(detail)) => {
                    member.transition(RequestState::Dispatched, RequestState::Failed);
                    member.resolve(Err(RingBatchError::execution(format!(
                        "request {} in batch {} on worker {}: {}",
                        id, batch_id, worker_id, detail
                    ))));
                }
                None => {
                    member.transition(RequestState::Dispatched, RequestState::Failed);
                    member.resolve(Err(RingBatchError::execution(format!(
                        "request {} in batch {} on worker {}: no output returned",
                        id, batch_id, worker_id
                    ))));
                }
            }
        }

        if !outcomes.is_empty() {
            let mut unknown: Vec<RequestId> = outcomes.into_keys().collect();
            unknown.sort_unstable();
            warn!(batch_id, ?unknown, "Ignoring outcomes for requests not in batch");
        }

        debug!(
            batch_id,
            worker = worker_id,
            completed,
            elapsed = ?flight.dispatched_at.elapsed(),
            "Batch resolved"
        );
        self.pool.release(flight.lease);
        Ok(())
    }

    /// Fail every member of a batch whose worker died. Nothing is re-queued.
    pub fn on_worker_error(&self, batch_id: BatchId, error: RingBatchError) -> Result<()> {
        let flight = self.take_in_flight(batch_id)?;
        let worker_id = flight.lease.worker_id();
        METRICS.dispatch.worker_failures.inc();
        error!(
            batch_id,
            worker = worker_id,
            members = flight.members.len(),
            "Worker failed mid-batch: {}",
            error
        );

        let members = flight.members;
        for member in &members {
            member.transition(RequestState::Dispatched, RequestState::Failed);
        }
        fail_all(members, |id| {
            RingBatchError::worker_unavailable(format!(
                "request {} in batch {} on worker {}: {}",
                id, batch_id, worker_id, error
            ))
        });

        self.pool.release(flight.lease);
        Ok(())
    }
}

fn resolve_cancelled(member: &mut RequestRecord, batch_id: BatchId) {
    debug!(request_id = member.id(), batch_id, "Skipping cancelled member");
    member.resolve(Err(RingBatchError::cancelled(format!(
        "request {} cancelled before batch {} was dispatched",
        member.id(),
        batch_id
    ))));
}

fn fail_all<F>(members: Vec<RequestRecord>, error_for: F)
where
    F: Fn(RequestId) -> RingBatchError,
{
    for mut member in members {
        let error = error_for(member.id());
        member.resolve(Err(error));
    }
}

impl std::fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("pool", &self.pool)
            .field("in_flight", &self.in_flight_batches())
            .finish()
    }
}
