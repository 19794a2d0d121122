//! RingBatch Worker
//!
//! The execution side of the scheduler: worker shards that run sealed batches
//! through a generation backend, and the tokenizer used at admission.

pub mod backend;
pub mod shard;
pub mod simulated;
pub mod tokenizer;

pub use backend::{BatchOutput, ExecutionBackend, ExecutionBatch, RequestOutcome};
pub use shard::WorkerShard;
pub use simulated::{ExecutionLog, SimulatedBackend};
pub use tokenizer::{ByteTokenizer, Tokenizer};
