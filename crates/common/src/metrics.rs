//! Metrics collection for SkinScan
//!
//! Prometheus metrics for both pipeline stages and the request lifecycle.
//! Updates are plain atomic operations and safe to call from any thread.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for SkinScan
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub requests: RequestMetrics,
    pub preprocessing: PreprocessingMetrics,
    pub inference: InferenceMetrics,
}

/// Request lifecycle metrics
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Total number of accepted requests
    pub requests_total: IntCounter,

    /// Requests answered with scores
    pub requests_succeeded: IntCounter,

    /// Requests answered with an error code
    pub requests_failed: IntCounter,

    /// Requests rejected because a stage was stopping
    pub requests_rejected: IntCounter,

    /// Estimated latency handed to clients
    pub estimate_ms: Histogram,
}

/// Preprocessing stage metrics
#[derive(Debug, Clone)]
pub struct PreprocessingMetrics {
    /// Jobs submitted but not yet finished
    pub queue_depth: IntGauge,

    /// Duration of a single conversion
    pub duration: Histogram,
}

/// Inference stage metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Entries waiting for a batch slot
    pub queue_depth: IntGauge,

    /// Batch size distribution
    pub batch_size: Histogram,

    /// Load, infer and unload of one batch
    pub batch_duration: Histogram,

    /// Batches failed as a whole
    pub batches_failed: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid counter definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("valid gauge definition")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests = RequestMetrics {
            requests_total: counter("skinscan_requests_total", "Total number of accepted requests"),
            requests_succeeded: counter(
                "skinscan_requests_succeeded_total",
                "Requests answered with scores",
            ),
            requests_failed: counter(
                "skinscan_requests_failed_total",
                "Requests answered with an error code",
            ),
            requests_rejected: counter(
                "skinscan_requests_rejected_total",
                "Requests rejected while a stage was stopping",
            ),
            estimate_ms: histogram(
                "skinscan_request_estimate_milliseconds",
                "Latency estimate returned to clients",
                vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0],
            ),
        };

        let preprocessing = PreprocessingMetrics {
            queue_depth: gauge(
                "skinscan_preprocessing_queue_depth",
                "Preprocessing jobs submitted and not yet finished",
            ),
            duration: histogram(
                "skinscan_preprocessing_duration_seconds",
                "Duration of a single image conversion",
                vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25],
            ),
        };

        let inference = InferenceMetrics {
            queue_depth: gauge(
                "skinscan_inference_queue_depth",
                "Preprocessed requests waiting for inference",
            ),
            batch_size: histogram(
                "skinscan_inference_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            ),
            batch_duration: histogram(
                "skinscan_inference_batch_duration_seconds",
                "Load, infer and unload duration of one batch",
                vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
            ),
            batches_failed: counter(
                "skinscan_inference_batches_failed_total",
                "Batches that failed as a whole",
            ),
        };

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(requests.requests_total.clone()),
            Box::new(requests.requests_succeeded.clone()),
            Box::new(requests.requests_failed.clone()),
            Box::new(requests.requests_rejected.clone()),
            Box::new(requests.estimate_ms.clone()),
            Box::new(preprocessing.queue_depth.clone()),
            Box::new(preprocessing.duration.clone()),
            Box::new(inference.queue_depth.clone()),
            Box::new(inference.batch_size.clone()),
            Box::new(inference.batch_duration.clone()),
            Box::new(inference.batches_failed.clone()),
        ];

        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique within the registry");
        }

        MetricsRegistry {
            registry,
            requests,
            preprocessing,
            inference,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
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
