//! RingBatch wire messages
//!
//! Messages exchanged with the admission transport. The structs derive
//! `prost::Message` directly so they encode as protobuf without a build step,
//! and `serde` so the same shapes can be read from JSON request files.

use serde::{Deserialize, Serialize};

/// Generation request as submitted by a client
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    /// Prompt text; ignored when `prompt_tokens` is non-empty
    #[prost(string, tag = "1")]
    pub prompt: String,

    /// Pre-tokenized prompt
    #[prost(uint32, repeated, tag = "2")]
    pub prompt_tokens: Vec<u32>,

    #[prost(uint32, tag = "3")]
    pub min_tokens: u32,

    #[prost(uint32, tag = "4")]
    pub max_tokens: u32,

    #[prost(float, tag = "5")]
    pub temperature: f32,

    #[prost(float, tag = "6")]
    pub top_p: f32,

    #[prost(uint64, optional, tag = "7")]
    pub seed: Option<u64>,

    /// Completions requested; 0 is read as 1
    #[prost(uint32, tag = "8")]
    pub n: u32,

    /// Scheduling rank, lower is served first
    #[prost(uint32, optional, tag = "9")]
    pub priority: Option<u32>,
}

/// Terminal status of a request
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum RequestStatus {
    Unspecified = 0,
    Completed = 1,
    Failed = 2,
    Cancelled = 3,
    Rejected = 4,
}

/// Result returned to the client
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateResponse {
    #[prost(uint64, tag = "1")]
    pub request_id: u64,

    #[prost(enumeration = "RequestStatus", tag = "2")]
    pub status: i32,

    #[prost(string, tag = "3")]
    pub text: String,

    #[prost(uint32, repeated, tag = "4")]
    pub tokens: Vec<u32>,

    /// Failure detail when status is not `Completed`
    #[prost(string, optional, tag = "5")]
    pub error: Option<String>,
}

impl GenerateResponse {
    /// Whether the request produced a generation
    pub fn is_completed(&self) -> bool {
        self.status == RequestStatus::Completed as i32
    }
}
