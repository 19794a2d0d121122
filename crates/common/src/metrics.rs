//! Metrics collection for RingBatch
//!
//! This module provides Prometheus metrics for the admission, batching and
//! dispatch stages. Queue depth and submit wait double as the backpressure
//! signals the admission layer watches.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for RingBatch
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub admission: AdmissionMetrics,
    pub batching: BatchingMetrics,
    pub dispatch: DispatchMetrics,
}

/// Admission and request outcome metrics
#[derive(Debug, Clone)]
pub struct AdmissionMetrics {
    /// Requests accepted into a shard queue
    pub requests_admitted: IntCounter,

    /// Requests rejected at admission, by reason
    pub requests_rejected: IntCounterVec,

    /// Requests resolved with a generation
    pub requests_completed: IntCounter,

    /// Requests resolved with a failure
    pub requests_failed: IntCounter,

    /// Requests withdrawn before dispatch
    pub requests_cancelled: IntCounter,

    /// Requests currently queued across all shards
    pub queue_depth: IntGauge,
}

/// Batch assembly metrics
#[derive(Debug, Clone)]
pub struct BatchingMetrics {
    /// Batches sealed by assemblers
    pub batches_sealed: IntCounter,

    /// Single-member batches over the token budget
    pub oversized_batches: IntCounter,

    /// Members per batch
    pub batch_size: Histogram,

    /// Token budget used per batch
    pub batch_tokens: Histogram,

    /// Time from admission to sealing
    pub queue_wait: Histogram,
}

/// Dispatch and execution metrics
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    /// Time an assembler waits in submit for a free worker
    pub submit_wait: Histogram,

    /// Batches currently executing
    pub in_flight_batches: IntGauge,

    /// Workers currently holding a batch
    pub busy_workers: IntGauge,

    /// Worker execution time per batch
    pub execution_duration: Histogram,

    /// Whole-batch worker failures
    pub worker_failures: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("metric definitions are static and valid");
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Admission metrics
        let requests_admitted = IntCounter::new(
            "ringbatch_requests_admitted_total",
            "Total number of requests admitted into a shard queue",
        )?;

        let requests_rejected = IntCounterVec::new(
            Opts::new(
                "ringbatch_requests_rejected_total",
                "Total number of requests rejected at admission",
            ),
            &["reason"],
        )?;

        let requests_completed = IntCounter::new(
            "ringbatch_requests_completed_total",
            "Total number of requests resolved with a generation",
        )?;

        let requests_failed = IntCounter::new(
            "ringbatch_requests_failed_total",
            "Total number of requests resolved with a failure",
        )?;

        let requests_cancelled = IntCounter::new(
            "ringbatch_requests_cancelled_total",
            "Total number of requests cancelled before dispatch",
        )?;

        let queue_depth = IntGauge::new(
            "ringbatch_queue_depth",
            "Current number of queued requests across all shards",
        )?;

        // Batching metrics
        let batches_sealed = IntCounter::new(
            "ringbatch_batches_sealed_total",
            "Total number of batches sealed",
        )?;

        let oversized_batches = IntCounter::new(
            "ringbatch_oversized_batches_total",
            "Single-request batches whose cost exceeds the token budget",
        )?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("ringbatch_batch_size", "Requests per batch")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]),
        )?;

        let batch_tokens = Histogram::with_opts(
            HistogramOpts::new("ringbatch_batch_tokens", "Token budget used per batch").buckets(
                vec![16.0, 64.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0],
            ),
        )?;

        let queue_wait = Histogram::with_opts(
            HistogramOpts::new(
                "ringbatch_queue_wait_seconds",
                "Time requests spend queued before their batch is sealed",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;

        // Dispatch metrics
        let submit_wait = Histogram::with_opts(
            HistogramOpts::new(
                "ringbatch_submit_wait_seconds",
                "Time a sealed batch waits for a free worker",
            )
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;

        let in_flight_batches = IntGauge::new(
            "ringbatch_in_flight_batches",
            "Current number of batches executing on workers",
        )?;

        let busy_workers = IntGauge::new(
            "ringbatch_busy_workers",
            "Current number of workers holding a batch",
        )?;

        let execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ringbatch_execution_duration_seconds",
                "Worker execution time per batch",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0]),
        )?;

        let worker_failures = IntCounter::new(
            "ringbatch_worker_failures_total",
            "Total number of whole-batch worker failures",
        )?;

        // Register all metrics
        registry.register(Box::new(requests_admitted.clone()))?;
        registry.register(Box::new(requests_rejected.clone()))?;
        registry.register(Box::new(requests_completed.clone()))?;
        registry.register(Box::new(requests_failed.clone()))?;
        registry.register(Box::new(requests_cancelled.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        registry.register(Box::new(batches_sealed.clone()))?;
        registry.register(Box::new(oversized_batches.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(batch_tokens.clone()))?;
        registry.register(Box::new(queue_wait.clone()))?;

        registry.register(Box::new(submit_wait.clone()))?;
        registry.register(Box::new(in_flight_batches.clone()))?;
        registry.register(Box::new(busy_workers.clone()))?;
        registry.register(Box::new(execution_duration.clone()))?;
        registry.register(Box::new(worker_failures.clone()))?;

        let admission = AdmissionMetrics {
            requests_admitted,
            requests_rejected,
            requests_completed,
            requests_failed,
            requests_cancelled,
            queue_depth,
        };

        let batching = BatchingMetrics {
            batches_sealed,
            oversized_batches,
            batch_size,
            batch_tokens,
            queue_wait,
        };

        let dispatch = DispatchMetrics {
            submit_wait,
            in_flight_batches,
            busy_workers,
            execution_duration,
            worker_failures,
        };

        Ok(MetricsRegistry {
            registry,
            admission,
            batching,
            dispatch,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> crate::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| crate::RingBatchError::internal(format!("metrics are not UTF-8: {}", e)))
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Run a closure and record how long it took
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
