//! Deterministic stand-in backend
//!
//! Produces pseudo-random printable tokens seeded from the request's sampling
//! seed and prompt, so a given request always yields the same generation.
//! Failure injection and an execution log make it usable as a test double.

use crate::backend::{BatchOutput, ExecutionBackend, ExecutionBatch};
use parking_lot::Mutex;
use ringbatch_common::{Generation, RequestId, RingBatchError, Result, WorkItem};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Shared record of the member ids of every batch a backend executed
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog {
    batches: Arc<Mutex<Vec<Vec<RequestId>>>>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, members: Vec<RequestId>) {
        self.batches.lock().push(members);
    }

    /// Member ids per executed batch, in execution order
    pub fn batches(&self) -> Vec<Vec<RequestId>> {
        self.batches.lock().clone()
    }

    /// Every executed request id
    pub fn requests(&self) -> Vec<RequestId> {
        self.batches.lock().iter().flatten().copied().collect()
    }
}

/// Simulated generation backend
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    per_token_latency: Duration,
    failing_requests: HashSet<RequestId>,
    crash_after_batches: Option<u64>,
    batches_seen: u64,
    log: Option<ExecutionLog>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long per generated token of the longest member
    pub fn with_latency(mut self, per_token: Duration) -> Self {
        self.per_token_latency = per_token;
        self
    }

    /// Report a per-request failure for this request
    pub fn fail_request(mut self, request_id: RequestId) -> Self {
        self.failing_requests.insert(request_id);
        self
    }

    /// Fail whole batches once `batches` batches have succeeded
    pub fn crash_after(mut self, batches: u64) -> Self {
        self.crash_after_batches = Some(batches);
        self
    }

    /// Record executed batch memberships into `log`
    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    fn generate(&self, item: &WorkItem) -> Generation {
        let mut state = item.sampling.seed.unwrap_or(0) ^ 0x9e37_79b9_7f4a_7c15;
        for &token in &item.tokens {
            state = mix(state ^ u64::from(token));
        }
        state = mix(state ^ item.request_id);

        let span = item.max_tokens.saturating_sub(item.min_tokens);
        let length = if span == 0 {
            item.max_tokens
        } else {
            state = mix(state);
            item.min_tokens + (state % u64::from(span + 1)) as u32
        };

        let tokens = (0..length)
            .map(|_| {
                state = mix(state);
                // printable ASCII, so byte-level detokenization reads cleanly
                32 + (state % 95) as u32
            })
            .collect();

        Generation {
            request_id: item.request_id,
            tokens,
            text: String::new(),
        }
    }
}

// splitmix64 finalizer
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl ExecutionBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn execute(&mut self, batch: &ExecutionBatch) -> Result<BatchOutput> {
        if let Some(limit) = self.crash_after_batches {
            if self.batches_seen >= limit {
                return Err(RingBatchError::worker_unavailable(format!(
                    "simulated crash on worker {} executing batch {}",
                    batch.worker_id, batch.batch_id
                )));
            }
        }
        self.batches_seen += 1;

        if let Some(log) = &self.log {
            log.record(batch.items.iter().map(|item| item.request_id).collect());
        }

        let longest = batch
            .items
            .iter()
            .map(|item| item.max_tokens)
            .max()
            .unwrap_or(0);
        if !self.per_token_latency.is_zero() {
            std::thread::sleep(self.per_token_latency * longest);
        }

        let mut output = BatchOutput::new(batch.batch_id);
        for item in &batch.items {
            if self.failing_requests.contains(&item.request_id) {
                output.push(
                    item.request_id,
                    Err(format!("simulated failure for request {}", item.request_id)),
                );
                continue;
            }

            let generation = self.generate(item);
            trace!(
                request_id = item.request_id,
                tokens = generation.tokens.len(),
                "Simulated generation"
            );
            output.push(item.request_id, Ok(generation));
        }

        Ok(output)
    }
}
