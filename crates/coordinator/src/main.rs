//! RingBatch Coordinator - Main Entry Point
//!
//! Loads configuration, starts the scheduler over simulated worker shards and
//! pushes a handful of prompts through it.

use anyhow::{Context, Result};
use ringbatch_common::{RingBatchConfig, METRICS};
use ringbatch_coordinator::{Admission, Scheduler};
use ringbatch_proto::GenerateRequest;
use ringbatch_worker::{ByteTokenizer, SimulatedBackend, WorkerShard};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SMOKE_PROMPTS: [&str; 3] = [
    "this is a test",
    "this is another test",
    "they dont really care about us",
];

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var("RINGBATCH_CONFIG") {
        Ok(path) => RingBatchConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => RingBatchConfig::from_env().context("loading configuration from environment")?,
    };
    let observability = config.observability();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("ringbatch_coordinator={0},ringbatch_worker={0}", observability.log_level).into()
    });
    if observability.structured_logging {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!(
        "Starting RingBatch Coordinator: shards={}, workers={}, max_batch_tokens={}",
        config.scheduler.num_shards, config.workers.num_workers, config.scheduler.max_batch_tokens
    );

    let latency = Duration::from_millis(config.workers.simulated_ms_per_token);
    let shards = WorkerShard::build_pool(config.workers.num_workers, |_| {
        Box::new(SimulatedBackend::new().with_latency(latency))
    });

    let scheduler = Scheduler::new(config, shards)?;
    let admission = Admission::new(scheduler.clone(), Arc::new(ByteTokenizer));
    scheduler.start();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let prompts: Vec<String> = if args.is_empty() {
        SMOKE_PROMPTS.iter().map(|p| p.to_string()).collect()
    } else {
        args
    };

    let mut requests = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        let request = GenerateRequest {
            prompt: prompt.clone(),
            min_tokens: 4,
            max_tokens: 4,
            temperature: 1.0,
            top_p: 0.0,
            seed: Some(11619),
            n: 1,
            ..Default::default()
        };
        let admission = admission.clone();
        requests.push(tokio::spawn(async move {
            (prompt, admission.generate(&request).await)
        }));
    }

    let responses = async {
        for request in requests {
            match request.await {
                Ok((prompt, response)) if response.is_completed() => {
                    info!(
                        request_id = response.request_id,
                        "{:?} -> {:?}", prompt, response.text
                    );
                }
                Ok((prompt, response)) => {
                    warn!(
                        request_id = response.request_id,
                        status = ?response.status(),
                        "{:?} failed: {}",
                        prompt,
                        response.error.as_deref().unwrap_or_default()
                    );
                }
                Err(e) => error!("Request task failed: {}", e),
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = responses => {
            info!("All requests finished");
        }
    }

    if observability.enable_metrics {
        match METRICS.gather() {
            Ok(text) => info!("Metrics:\n{}", text),
            Err(e) => warn!("Failed to gather metrics: {}", e),
        }
    }

    scheduler.shutdown().await?;
    info!("RingBatch Coordinator shut down");
    Ok(())
}
