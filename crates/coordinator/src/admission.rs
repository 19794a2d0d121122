//! Admission bridge
//!
//! Turns wire-level `GenerateRequest`s into scheduler requests and awaited
//! outcomes back into `GenerateResponse`s. The transport in front of it owns
//! connections and streaming; this layer only converts and forwards.

use crate::request::{GenerationResult, RequestHandle, RequestSpec};
use crate::scheduler::Scheduler;
use ringbatch_common::{Priority, RequestId, RingBatchError, Result, SamplingParams};
use ringbatch_proto::{GenerateRequest, GenerateResponse, RequestStatus};
use ringbatch_worker::Tokenizer;
use std::sync::Arc;
use tracing::{debug, warn};

/// Converts between wire messages and the scheduler
#[derive(Clone)]
pub struct Admission {
    scheduler: Arc<Scheduler>,
    tokenizer: Arc<dyn Tokenizer>,
}

impl Admission {
    pub fn new(scheduler: Arc<Scheduler>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            scheduler,
            tokenizer,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Build a scheduler request, tokenizing the prompt unless tokens were sent
    pub fn to_spec(&self, request: &GenerateRequest) -> Result<RequestSpec> {
        let tokens = if request.prompt_tokens.is_empty() {
            self.tokenizer.encode(&request.prompt)?
        } else {
            request.prompt_tokens.clone()
        };

        let sampling = SamplingParams {
            temperature: request.temperature,
            top_p: request.top_p,
            seed: request.seed,
            n: request.n.max(1),
            ..Default::default()
        };

        Ok(RequestSpec::new(tokens, request.max_tokens)
            .with_min_tokens(request.min_tokens)
            .with_priority(request.priority.map(Priority).unwrap_or_default())
            .with_sampling(sampling))
    }

    /// Admit a request without waiting for its result
    pub fn submit(&self, request: &GenerateRequest) -> Result<RequestHandle> {
        let spec = self.to_spec(request)?;
        self.scheduler.admit(spec)
    }

    /// Wire response for a finished request
    pub fn respond(&self, request_id: RequestId, result: GenerationResult) -> GenerateResponse {
        let mut response = GenerateResponse {
            request_id,
            ..Default::default()
        };

        match result {
            Ok(generation) => {
                let text = if generation.text.is_empty() {
                    match self.tokenizer.decode(&generation.tokens) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(request_id, "Failed to detokenize generation: {}", e);
                            String::new()
                        }
                    }
                } else {
                    generation.text
                };
                response.set_status(RequestStatus::Completed);
                response.text = text;
                response.tokens = generation.tokens;
            }
            Err(e) => {
                response.set_status(status_for(&e));
                response.error = Some(e.to_string());
            }
        }
        response
    }

    /// Admit a request and wait for its response. Never fails: rejections
    /// come back as a `Rejected` response.
    pub async fn generate(&self, request: &GenerateRequest) -> GenerateResponse {
        match self.submit(request) {
            Ok(handle) => {
                let id = handle.id();
                let result = handle.wait().await;
                debug!(request_id = id, ok = result.is_ok(), "Request finished");
                self.respond(id, result)
            }
            Err(e) => {
                debug!("Request rejected at admission: {}", e);
                let mut response = GenerateResponse {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
                response.set_status(status_for(&e));
                response
            }
        }
    }

    /// Requests waiting across every ring shard
    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth()
    }

    /// Workers free right now; zero means new batches wait in `submit`
    pub fn available_workers(&self) -> usize {
        self.scheduler.available_workers()
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

fn status_for(error: &RingBatchError) -> RequestStatus {
    match error {
        RingBatchError::InvalidRequest(_) | RingBatchError::QueueSaturated(_) => {
            RequestStatus::Rejected
        }
        RingBatchError::Cancelled(_) | RingBatchError::ShuttingDown(_) => RequestStatus::Cancelled,
        _ => RequestStatus::Failed,
    }
}
