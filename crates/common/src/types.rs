//! Shared domain types
//!
//! Identifiers, priorities and the payloads exchanged between the scheduler
//! core and the worker shards.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Request identifier, assigned once at admission and never reused
pub type RequestId = u64;

/// Batch identifier, unique per dispatch attempt
pub type BatchId = u64;

/// Index of a worker shard in the pool
pub type WorkerId = usize;

/// Token id as produced by the tokenizer
pub type TokenId = u32;

/// Scheduling rank; a lower value is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u32);

impl Priority {
    pub const HIGH: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const LOW: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sampling parameters forwarded untouched to the execution backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub seed: Option<u64>,

    /// Number of completions requested
    #[serde(default = "default_n")]
    pub n: u32,

    /// Backend-specific settings the scheduler does not interpret
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_temperature() -> f32 {
    1.0
}

fn default_top_p() -> f32 {
    1.0
}

fn default_n() -> u32 {
    1
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            seed: None,
            n: default_n(),
            extra: serde_json::Map::new(),
        }
    }
}

impl SamplingParams {
    /// Stable fingerprint of the settings that make two requests batchable
    /// together. `extra` is folded in through its serialized form.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.temperature.to_bits().hash(&mut hasher);
        self.top_p.to_bits().hash(&mut hasher);
        self.seed.hash(&mut hasher);
        self.n.hash(&mut hasher);
        if !self.extra.is_empty() {
            serde_json::Value::Object(self.extra.clone())
                .to_string()
                .hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// One batch member as seen by a worker shard
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub request_id: RequestId,
    pub tokens: Vec<TokenId>,
    pub min_tokens: u32,
    pub max_tokens: u32,
    pub sampling: SamplingParams,
}

/// Output of one request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Generation {
    pub request_id: RequestId,

    /// Generated token ids, prompt excluded
    pub tokens: Vec<TokenId>,

    /// Detokenized text; empty when the backend does not detokenize
    #[serde(default)]
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::HIGH < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::LOW);
        assert_eq!(Priority::default(), Priority::NORMAL);
    }

    #[test]
    fn test_sampling_fingerprint() {
        let a = SamplingParams::default();
        let mut b = SamplingParams::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.top_p = 0.9;
        assert_ne!(a.fingerprint(), b.fingerprint());

        let mut c = SamplingParams::default();
        c.extra.insert("logprobs".to_string(), serde_json::json!(5));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_sampling_params_keep_unknown_fields() {
        let params: SamplingParams =
            serde_json::from_str(r#"{"temperature": 0.7, "best_of": 3}"#).unwrap();

        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.n, 1);
        assert_eq!(params.extra.get("best_of"), Some(&serde_json::json!(3)));
    }
}
