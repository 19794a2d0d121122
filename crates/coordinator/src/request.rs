//! Request records and their lifecycle
//!
//! A record is created at admission and moves through
//! `Queued -> Batched -> Dispatched -> {Completed, Failed}`, with `Cancelled`
//! reachable from `Queued` or `Batched`. The state lives in an atomic cell
//! shared with the caller's cancel token, so the race between a cancel and a
//! dispatch is settled by a single compare-exchange.

use ringbatch_common::config::{AdmissionConfig, CostModel};
use ringbatch_common::{
    Generation, Priority, RequestId, RingBatchError, Result, SamplingParams, TokenId, WorkItem,
    METRICS,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

/// What a caller eventually receives for a request
pub type GenerationResult = Result<Generation>;

/// Scheduling state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestState {
    Queued = 0,
    Batched = 1,
    Dispatched = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestState::Queued,
            1 => RequestState::Batched,
            2 => RequestState::Dispatched,
            3 => RequestState::Completed,
            4 => RequestState::Failed,
            _ => RequestState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Queued, Batched)
                | (Batched, Dispatched)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Queued, Cancelled)
                | (Batched, Cancelled)
        )
    }
}

/// Atomic holder of a request's state
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(RequestState::Queued as u8))
    }

    pub fn get(&self) -> RequestState {
        RequestState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from -> to` if the cell still holds `from`
    pub fn transition(&self, from: RequestState, to: RequestState) -> bool {
        debug_assert!(from.can_transition_to(to), "illegal edge {:?} -> {:?}", from, to);
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A generation request as presented for admission
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub tokens: Vec<TokenId>,
    pub min_tokens: u32,
    pub max_tokens: u32,
    pub priority: Priority,
    pub sampling: SamplingParams,
}

impl RequestSpec {
    /// A request for exactly `max_tokens` new tokens at normal priority
    pub fn new(tokens: Vec<TokenId>, max_tokens: u32) -> Self {
        Self {
            tokens,
            min_tokens: 0,
            max_tokens,
            priority: Priority::default(),
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_min_tokens(mut self, min_tokens: u32) -> Self {
        self.min_tokens = min_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// Check the request against admission limits
    pub fn validate(&self, limits: &AdmissionConfig) -> Result<()> {
        if self.tokens.is_empty() {
            return Err(RingBatchError::invalid_request("prompt has no tokens"));
        }
        if self.max_tokens == 0 {
            return Err(RingBatchError::invalid_request(
                "max_tokens is 0, no tokens could be generated",
            ));
        }
        if self.min_tokens > self.max_tokens {
            return Err(RingBatchError::invalid_request(format!(
                "min_tokens ({}) exceeds max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        let total = self.tokens.len() + self.max_tokens as usize;
        if total > limits.max_seq_len {
            return Err(RingBatchError::invalid_request(format!(
                "prompt ({}) plus max_tokens ({}) exceeds max_seq_len ({})",
                self.tokens.len(),
                self.max_tokens,
                limits.max_seq_len
            )));
        }
        if self.sampling.n == 0 || self.sampling.n > limits.max_n {
            return Err(RingBatchError::invalid_request(format!(
                "n must be between 1 and {}, got {}",
                limits.max_n, self.sampling.n
            )));
        }
        Ok(())
    }

    /// Cost of this request against a batch token budget
    pub fn cost(&self, model: CostModel) -> usize {
        match model {
            CostModel::PromptOnly => self.tokens.len(),
            CostModel::PromptPlusGeneration => self.tokens.len() + self.max_tokens as usize,
        }
    }
}

/// An admitted request, owned by exactly one stage at a time
pub struct RequestRecord {
    id: RequestId,
    spec: RequestSpec,
    cost: usize,
    arrival_time: Instant,
    state: Arc<StateCell>,
    responder: Option<oneshot::Sender<GenerationResult>>,
}

impl RequestRecord {
    pub(crate) fn new(
        id: RequestId,
        spec: RequestSpec,
        cost_model: CostModel,
        responder: oneshot::Sender<GenerationResult>,
    ) -> Self {
        Self {
            id,
            cost: spec.cost(cost_model),
            spec,
            arrival_time: Instant::now(),
            state: Arc::new(StateCell::new()),
            responder: Some(responder),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.spec.priority
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn cost(&self) -> usize {
        self.cost
    }

    pub fn spec(&self) -> &RequestSpec {
        &self.spec
    }

    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub(crate) fn transition(&self, from: RequestState, to: RequestState) -> bool {
        self.state.transition(from, to)
    }

    /// Ordering key within a shard: priority, then arrival, then id
    pub fn schedule_key(&self) -> (Priority, Instant, RequestId) {
        (self.spec.priority, self.arrival_time, self.id)
    }

    pub(crate) fn to_work_item(&self) -> WorkItem {
        WorkItem {
            request_id: self.id,
            tokens: self.spec.tokens.clone(),
            min_tokens: self.spec.min_tokens,
            max_tokens: self.spec.max_tokens,
            sampling: self.spec.sampling.clone(),
        }
    }

    /// Deliver the final result to the caller. Only the first call has effect.
    pub(crate) fn resolve(&mut self, result: GenerationResult) {
        let Some(responder) = self.responder.take() else {
            return;
        };

        let admission = &METRICS.admission;
        match &result {
            Ok(_) => admission.requests_completed.inc(),
            Err(RingBatchError::Cancelled(_)) | Err(RingBatchError::ShuttingDown(_)) => {
                admission.requests_cancelled.inc()
            }
            Err(_) => admission.requests_failed.inc(),
        }

        if responder.send(result).is_err() {
            debug!(request_id = self.id, "Caller dropped the result channel");
        }
    }
}

impl std::fmt::Debug for RequestRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("priority", &self.spec.priority)
            .field("cost", &self.cost)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Lets the owning producer withdraw a request before dispatch
#[derive(Debug, Clone)]
pub struct CancelToken {
    pub(crate) id: RequestId,
    pub(crate) shard: usize,
    pub(crate) state: Arc<StateCell>,
}

impl CancelToken {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state.get()
    }
}

/// Caller's side of an admitted request
#[derive(Debug)]
pub struct RequestHandle {
    token: CancelToken,
    result: oneshot::Receiver<GenerationResult>,
}

impl RequestHandle {
    pub(crate) fn new(
        id: RequestId,
        shard: usize,
        state: Arc<StateCell>,
        result: oneshot::Receiver<GenerationResult>,
    ) -> Self {
        Self {
            token: CancelToken { id, shard, state },
            result,
        }
    }

    pub fn id(&self) -> RequestId {
        self.token.id
    }

    /// Ring shard the request was routed to
    pub fn shard(&self) -> usize {
        self.token.shard
    }

    pub fn state(&self) -> RequestState {
        self.token.state.get()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Wait for the request's final result
    pub async fn wait(self) -> GenerationResult {
        let id = self.token.id;
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(RingBatchError::shutting_down(format!(
                "scheduler dropped request {} without a result",
                id
            ))),
        }
    }
}
