//! RPC metrics
//!
//! Operation counters and latencies, exposed in the Prometheus text format
//! at `/metrics`. Each [`RpcMetrics`] owns its registry so several routers
//! can coexist in one process (tests do this).

use crate::error::{Code, Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

const NAMESPACE: &str = "flexblock_csi";

#[derive(Clone)]
pub struct RpcMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

impl RpcMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Completed RPC operations by result code")
                .namespace(NAMESPACE),
            &["operation", "code"],
        )
        .map_err(metrics_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Duration of RPC operations")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            duration,
        })
    }

    pub fn observe(&self, operation: &str, code: Code, elapsed: Duration) {
        self.operations
            .with_label_values(&[operation, code.as_str()])
            .inc();
        self.duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every metric in this registry
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_render() {
        let metrics = RpcMetrics::new().unwrap();
        metrics.observe("CreateVolume", Code::Ok, Duration::from_millis(20));
        metrics.observe("CreateVolume", Code::NotFound, Duration::from_millis(5));

        let (content_type, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains(
            "flexblock_csi_operations_total{code=\"OK\",operation=\"CreateVolume\"} 1"
        ));
        assert!(text.contains("flexblock_csi_operation_duration_seconds_count{operation=\"CreateVolume\"} 2"));
    }
}
