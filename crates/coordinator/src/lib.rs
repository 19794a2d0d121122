//! RingBatch Coordinator
//!
//! Priority-queue-backed dynamic batching in front of a pool of worker
//! shards. Requests are routed into a ring of per-shard priority queues, one
//! assembler per shard packs them into token-budgeted batches, and the
//! dispatch coordinator runs each batch on a free worker and resolves every
//! member's result.

pub mod admission;
pub mod assembler;
pub mod batch;
pub mod dispatch;
pub mod pool;
pub mod queue;
pub mod request;
pub mod scheduler;

pub use admission::Admission;
pub use assembler::BatchAssembler;
pub use batch::{BudgetGate, OpenBatch, SealedBatch};
pub use dispatch::DispatchCoordinator;
pub use pool::{WorkerLease, WorkerPool};
pub use queue::RingShardedQueue;
pub use request::{
    CancelToken, GenerationResult, RequestHandle, RequestRecord, RequestSpec, RequestState,
};
pub use scheduler::Scheduler;
