//! Tracing and telemetry instrumentation for ensembler.
//!
//! Span constructors for the operations worth following in a trace (driver
//! submissions and kills, snapshot merges, peer sessions) and `record_*`
//! helpers that log an occurrence and, with the `metrics` feature, update the
//! matching Prometheus series. Every helper works with the feature disabled.
//!
//! # Example
//!
//! ```ignore
//! use ensembler::telemetry::{instrument_driver_call, record_snapshot_merge};
//!
//! instrument_driver_call("submit", iens, driver.submit(&realization)).await?;
//! record_snapshot_merge(iteration, "applied", 12);
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{info_span, Instrument, Span};

use crate::protocol::PeerRole;
use crate::realization::{Iens, RealizationState};

/// Span covering the whole lifetime of one realization attempt.
#[must_use]
pub fn realization_span(iens: Iens, attempt: u32) -> Span {
    info_span!("ensembler.realization", iens = %iens, attempt = attempt)
}

/// Span for a driver submission.
#[must_use]
pub fn submit_span(iens: Iens) -> Span {
    info_span!("ensembler.submit", iens = %iens)
}

/// Span for a driver kill request.
#[must_use]
pub fn kill_span(iens: Iens) -> Span {
    info_span!("ensembler.kill", iens = %iens)
}

/// Span for one connected peer session.
#[must_use]
pub fn peer_span(identity: impl AsRef<str>, role: PeerRole) -> Span {
    info_span!(
        "ensembler.peer",
        identity = %identity.as_ref(),
        role = %role,
    )
}

/// Span for merging one batch of deltas into the canonical snapshot.
#[must_use]
pub fn merge_span(iteration: u32, batch_len: usize) -> Span {
    info_span!("ensembler.merge", iteration = iteration, batch_len = batch_len)
}

/// Attach the span matching `operation` (`submit` or `kill`) to a driver future.
pub fn instrument_driver_call<F>(
    operation: &'static str,
    iens: Iens,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let span = match operation {
        "kill" => kill_span(iens),
        _ => submit_span(iens),
    };
    future.instrument(span)
}

/// Record a realization state change.
pub fn record_transition(iens: Iens, from: RealizationState, to: RealizationState) {
    tracing::debug!(iens = %iens, from = %from, to = %to, "realization transition");

    #[cfg(feature = "metrics")]
    crate::metrics::record_transition(to.as_str());
}

/// Observe how long a realization ran before reaching `terminal`.
pub fn observe_realization_duration(terminal: RealizationState, elapsed: Duration) {
    tracing::debug!(
        state = %terminal,
        duration_secs = elapsed.as_secs_f64(),
        "realization duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_realization_duration(terminal.as_str(), elapsed.as_secs_f64());
}

/// Record the outcome of a snapshot merge.
pub fn record_snapshot_merge(iteration: u32, outcome: &'static str, batch_len: usize) {
    tracing::debug!(
        iteration = iteration,
        outcome = outcome,
        batch_len = batch_len,
        "snapshot merge"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_snapshot_merge(outcome);
}

/// Record a peer dropped for missing heartbeats.
pub fn record_heartbeat_timeout(identity: impl AsRef<str>, role: PeerRole, realizations: usize) {
    tracing::warn!(
        identity = %identity.as_ref(),
        role = %role,
        realizations = realizations,
        "peer heartbeat lapsed, disconnecting"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_heartbeat_timeout(role.as_str());
}

/// Record a discarded frame.
pub fn record_protocol_error(identity: impl AsRef<str>, err: &crate::error::ProtocolError) {
    tracing::warn!(
        identity = %identity.as_ref(),
        kind = err.kind(),
        "protocol error: {err}"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_protocol_error(err.kind());
}

/// Update the connected peer gauge for one role.
pub fn set_connected_peers(role: PeerRole, count: usize) {
    tracing::trace!(role = %role, count = count, "connected peers updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_connected_peers(role.as_str(), count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_span_names() {
        // Spans are disabled (no metadata) without an active subscriber.
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        for (span, name) in [
            (realization_span(Iens(1), 0), "ensembler.realization"),
            (submit_span(Iens(0)), "ensembler.submit"),
            (kill_span(Iens(0)), "ensembler.kill"),
            (peer_span("worker-0", PeerRole::Worker), "ensembler.peer"),
            (merge_span(0, 3), "ensembler.merge"),
        ] {
            assert_eq!(span.metadata().unwrap().name(), name);
        }
    }

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_transition(Iens(0), RealizationState::Waiting, RealizationState::Submitted);
        observe_realization_duration(RealizationState::Success, Duration::from_millis(5));
        record_snapshot_merge(0, "applied", 2);
        record_heartbeat_timeout("worker-0", PeerRole::Worker, 1);
        record_protocol_error("worker-0", &ProtocolError::NotConnected("worker-0".into()));
        set_connected_peers(PeerRole::Monitor, 1);
    }

    #[tokio::test]
    async fn test_instrument_driver_call_passes_output_through() {
        let out = instrument_driver_call("kill", Iens(3), async { 42 }).await;
        assert_eq!(out, 42);
    }
}
