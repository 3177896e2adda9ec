//! Metrics collection for Shardline
//!
//! This module provides Prometheus metrics for observability.
//! Forward-path metrics are plain atomics and cheap enough for the hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Shardline
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub forward: ForwardMetrics,
    pub worker: WorkerMetrics,
}

/// Forward-pass metrics
#[derive(Debug, Clone)]
pub struct ForwardMetrics {
    /// Forward call duration
    pub duration: Histogram,

    /// Sequences per forward call
    pub batch_size: Histogram,

    /// Tokens processed (prompt and decode)
    pub tokens_total: IntCounter,

    /// Forward calls that returned an error
    pub failures_total: IntCounter,

    /// Duration of a single collective operation
    pub collective_duration: Histogram,
}

/// Worker resource and lifecycle metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Bytes held by this worker's weight shard
    pub model_weight_bytes: IntGauge,

    /// Bytes held by the KV cache store
    pub kv_cache_bytes: IntGauge,

    /// Bytes held by the intermediate tensor pool
    pub scratch_bytes: IntGauge,

    /// Lifecycle phase (0 uninitialized, 1 joined, 2 model ready, 3 serving)
    pub phase: IntGauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .unwrap_or_else(|e| panic!("invalid histogram {}: {}", name, e))
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("invalid counter {}: {}", name, e))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).unwrap_or_else(|e| panic!("invalid gauge {}: {}", name, e))
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Forward metrics
        let duration = histogram(
            "shardline_forward_duration_seconds",
            "Forward call duration in seconds",
            vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
        );

        let batch_size = histogram(
            "shardline_forward_batch_size",
            "Sequences per forward call",
            vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
        );

        let tokens_total = counter(
            "shardline_forward_tokens_total",
            "Total number of tokens processed by forward calls",
        );

        let failures_total = counter(
            "shardline_forward_failures_total",
            "Total number of failed forward calls",
        );

        let collective_duration = histogram(
            "shardline_collective_duration_seconds",
            "Collective operation duration in seconds",
            vec![0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05],
        );

        // Worker metrics
        let model_weight_bytes = gauge(
            "shardline_model_weight_bytes",
            "Bytes held by the local weight shard",
        );

        let kv_cache_bytes = gauge("shardline_kv_cache_bytes", "Bytes held by the KV cache store");

        let scratch_bytes = gauge(
            "shardline_scratch_bytes",
            "Bytes held by the intermediate tensor pool",
        );

        let phase = gauge("shardline_worker_phase", "Worker lifecycle phase");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(duration.clone()),
            Box::new(batch_size.clone()),
            Box::new(tokens_total.clone()),
            Box::new(failures_total.clone()),
            Box::new(collective_duration.clone()),
            Box::new(model_weight_bytes.clone()),
            Box::new(kv_cache_bytes.clone()),
            Box::new(scratch_bytes.clone()),
            Box::new(phase.clone()),
        ];
        for collector in collectors {
            // Names are unique within this registry
            let _ = registry.register(collector);
        }

        MetricsRegistry {
            registry,
            forward: ForwardMetrics {
                duration,
                batch_size,
                tokens_total,
                failures_total,
                collective_duration,
            },
            worker: WorkerMetrics {
                model_weight_bytes,
                kv_cache_bytes,
                scratch_bytes,
                phase,
            },
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
