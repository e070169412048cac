use thiserror::Error;

use crate::realization::{Iens, RealizationState};

/// A trigger was fired from a state that does not accept it.
///
/// Fatal for the realization (it is finalized as `FAILED`), never for the ensemble.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("realization {iens}: `{trigger}` is not allowed from {from}")]
pub struct StateTransitionError {
    pub iens: Iens,
    pub trigger: &'static str,
    pub from: RealizationState,
}

/// Malformed, unexpected or out-of-sequence traffic on the wire.
///
/// These are logged and the offending frame is discarded; the connection stays up.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer `{0}` sent a frame before CONNECT")]
    NotConnected(String),
    #[error("peer `{attached}` tried to connect as `{claimed}`")]
    IdentityMismatch { attached: String, claimed: String },
    #[error("peer `{identity}` replayed sequence {seq}, last applied {last_applied}")]
    Duplicate {
        identity: String,
        seq: u64,
        last_applied: u64,
    },
    #[error("peer `{identity}` may not send `{event}` events")]
    UnexpectedEvent { identity: String, event: &'static str },
    #[error("link to the evaluator is closed")]
    Closed,
}

impl ProtocolError {
    /// Short label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge { .. } => "frame_too_large",
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::Io(_) => "io",
            ProtocolError::NotConnected(_) => "not_connected",
            ProtocolError::IdentityMismatch { .. } => "identity_mismatch",
            ProtocolError::Duplicate { .. } => "duplicate",
            ProtocolError::UnexpectedEvent { .. } => "unexpected_event",
            ProtocolError::Closed => "closed",
        }
    }
}

/// A partial snapshot arrived for an iteration whose full snapshot has not been seen.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("partial snapshot for iteration {iteration} arrived before its full snapshot")]
pub struct OrderingViolation {
    pub iteration: u32,
}

/// Errors surfaced to a monitor while it replays the evaluator's stream.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Ordering(#[from] OrderingViolation),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Ensemble-fatal failures. The evaluator reports these as `ensemble.terminated`
/// with a failure message and stops.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("scheduler failed: {0}")]
    Scheduler(String),
    #[error("evaluator stopped before the scheduler finished")]
    Interrupted,
}
