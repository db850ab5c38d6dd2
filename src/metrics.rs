//! Performance metrics collection for vecql
//!
//! Operators and the query evaluator record through the `metrics` facade;
//! exposing them in Prometheus format is up to the embedding binary.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize the metrics collection system
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record one batch emitted by an operator
pub fn record_batch(operator: &'static str, steps: usize) {
    counter!("vecql.operator.batches", "operator" => operator).increment(1);
    counter!("vecql.operator.steps", "operator" => operator).increment(steps as u64);
}

/// Record the size of a series array computed by an operator
pub fn record_series_loaded(operator: &'static str, count: usize) {
    histogram!("vecql.operator.series", "operator" => operator).record(count as f64);
}

/// Record a finished query evaluation
pub fn record_query(duration_ms: f64) {
    histogram!("vecql.query.duration_ms").record(duration_ms);
}

/// Record a failed query evaluation
pub fn record_query_failure(reason: &'static str) {
    counter!("vecql.query.failures", "reason" => reason).increment(1);
}
