//! Metrics collection and exposition.
//!
//! # Metrics
//! - `residency_responses_total{mode}` (counter): handler responses by
//!   recorder mode, `stream` or `buffer`
//! - `residency_replays_total{outcome}` (counter): replay dispatches by
//!   outcome, `ok`, `error` or `timeout`
//! - `residency_replay_duration_seconds{outcome}` (histogram): replay latency
//! - `residency_malformed_signals_total` (counter): redirect headers ignored
//! - `residency_pool_misses_total` (counter): buffers allocated because the
//!   pool was empty
//! - `proxy_requests_total{method,status}` (counter): upstream forwards
//! - `proxy_request_duration_seconds{method,status}` (histogram)

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    describe_counter!(
        "residency_responses_total",
        "Handler responses by recorder mode"
    );
    describe_counter!("residency_replays_total", "Replay dispatches by outcome");
    describe_histogram!(
        "residency_replay_duration_seconds",
        "Replay round-trip duration in seconds"
    );
    describe_counter!(
        "residency_malformed_signals_total",
        "Redirect signals that could not be parsed"
    );
    describe_counter!(
        "residency_pool_misses_total",
        "Buffers allocated because the pool was empty"
    );
    describe_counter!("proxy_requests_total", "Requests forwarded upstream");
    describe_histogram!(
        "proxy_request_duration_seconds",
        "Upstream forward duration in seconds"
    );

    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_response_mode(mode: &'static str) {
    counter!("residency_responses_total", "mode" => mode).increment(1);
}

pub fn record_replay(outcome: &'static str, start: Instant) {
    counter!("residency_replays_total", "outcome" => outcome).increment(1);
    histogram!("residency_replay_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_malformed_signal() {
    counter!("residency_malformed_signals_total").increment(1);
}

pub fn record_pool_miss() {
    counter!("residency_pool_misses_total").increment(1);
}

/// Record a request forwarded to the upstream.
pub fn record_request(method: &str, status: u16, start: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    counter!("proxy_requests_total", &labels).increment(1);
    histogram!("proxy_request_duration_seconds", &labels).record(start.elapsed().as_secs_f64());
}
