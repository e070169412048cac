//! Prometheus metrics for ensembler.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `ensembler_realization_transitions_total` - Realization states entered
//! - `ensembler_snapshot_merges_total` - Snapshot merges by outcome
//! - `ensembler_heartbeat_timeouts_total` - Peers dropped for missing heartbeats
//! - `ensembler_protocol_errors_total` - Discarded frames by error kind
//!
//! ## Gauges
//! - `ensembler_connected_peers` - Connected peers by role
//!
//! ## Histograms
//! - `ensembler_realization_duration_seconds` - Time from RUNNING to a terminal state
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for ensembler metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `state`.
pub static REALIZATION_TRANSITIONS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ensembler_realization_transitions_total",
        "Total number of realization states entered",
    );
    CounterVec::new(opts, &["state"])
        .expect("ensembler_realization_transitions_total metric creation failed")
});

/// Labels: `outcome` (applied, rejected_terminal).
pub static SNAPSHOT_MERGES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ensembler_snapshot_merges_total",
        "Total number of snapshot merges",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("ensembler_snapshot_merges_total metric creation failed")
});

/// Labels: `role`.
pub static HEARTBEAT_TIMEOUTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ensembler_heartbeat_timeouts_total",
        "Total number of peers dropped for missing heartbeats",
    );
    CounterVec::new(opts, &["role"])
        .expect("ensembler_heartbeat_timeouts_total metric creation failed")
});

/// Labels: `kind`.
pub static PROTOCOL_ERRORS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ensembler_protocol_errors_total",
        "Total number of discarded frames",
    );
    CounterVec::new(opts, &["kind"])
        .expect("ensembler_protocol_errors_total metric creation failed")
});

/// Labels: `role`.
pub static CONNECTED_PEERS: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("ensembler_connected_peers", "Currently connected peers");
    GaugeVec::new(opts, &["role"]).expect("ensembler_connected_peers metric creation failed")
});

/// Labels: `state` (the terminal state reached).
pub static REALIZATION_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "ensembler_realization_duration_seconds",
        "Realization run duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["state"])
        .expect("ensembler_realization_duration_seconds metric creation failed")
});

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(REALIZATION_TRANSITIONS_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(SNAPSHOT_MERGES_TOTAL.clone()),
        Box::new(HEARTBEAT_TIMEOUTS_TOTAL.clone()),
        Box::new(PROTOCOL_ERRORS_TOTAL.clone()),
        Box::new(CONNECTED_PEERS.clone()),
        Box::new(REALIZATION_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_transition(state: &str) {
    REALIZATION_TRANSITIONS_TOTAL
        .with_label_values(&[state])
        .inc();
}

pub fn record_snapshot_merge(outcome: &str) {
    SNAPSHOT_MERGES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_heartbeat_timeout(role: &str) {
    HEARTBEAT_TIMEOUTS_TOTAL.with_label_values(&[role]).inc();
}

pub fn record_protocol_error(kind: &str) {
    PROTOCOL_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn set_connected_peers(role: &str, count: f64) {
    CONNECTED_PEERS.with_label_values(&[role]).set(count);
}

pub fn observe_realization_duration(state: &str, duration_secs: f64) {
    REALIZATION_DURATION_SECONDS
        .with_label_values(&[state])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should be a no-op");
    }

    #[test]
    fn test_recorders() {
        record_transition("RUNNING");
        record_snapshot_merge("applied");
        record_snapshot_merge("rejected_terminal");
        record_heartbeat_timeout("worker");
        record_protocol_error("duplicate");
        set_connected_peers("monitor", 2.0);
        observe_realization_duration("SUCCESS", 12.5);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_transition("SUCCESS");
        record_heartbeat_timeout("worker");

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("ensembler_realization_transitions_total"));
        assert!(output.contains("ensembler_heartbeat_timeouts_total"));
    }
}
