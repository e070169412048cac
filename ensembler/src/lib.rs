//! Ensembler - realization scheduling and snapshot aggregation for ensemble experiments.
//!
//! An ensemble experiment runs many independent realizations of a simulation.
//! This crate submits them to a compute backend, tracks each one through its
//! lifecycle, aggregates the progress reported by remote workers into one
//! canonical snapshot and streams that snapshot to any number of monitors.
//!
//! # Core Concepts
//!
//! - **Realization**: One independent run, identified by its [`Iens`]. Its
//!   lifecycle is the [`RealizationStateMachine`]; every accepted move yields a
//!   [`Transition`].
//!
//! - **Scheduler**: The [`Scheduler`] admits realizations under a concurrency
//!   cap, submits them through a [`Driver`], enforces runtime limits, retries
//!   failures and stops early once enough realizations have succeeded.
//!
//! - **Snapshot**: [`Snapshot`] is the aggregated status of one iteration;
//!   [`PartialSnapshot`] is a delta that merges into it.
//!
//! - **Evaluator**: The [`Evaluator`] owns the canonical snapshot, batches
//!   worker events into deltas, broadcasts them to monitors and detects lost
//!   workers through heartbeats.
//!
//! - **Monitor**: A [`Monitor`] follows one evaluator and keeps a
//!   [`SnapshotReplica`] in step with it.
//!
//! - **Protocol**: Peers exchange length-prefixed JSON [`Frame`]s; see the
//!   [`protocol`] module.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use ensembler::*;
//!
//! let (evaluator, handle) = EvaluatorBuilder::new(EvaluatorConfig::new("poly", 0))
//!     .with_scheduler_config(SchedulerConfig::new(4))
//!     .with_realizations((0..10).map(|i| Realization::new(i, format!("runs/{i}"))))
//!     .with_driver(driver, driver_events)
//!     .build()?;
//! let run = tokio::spawn(evaluator.run());
//!
//! let mut monitor = Monitor::connect(handle.attach("monitor-0"))?;
//! monitor.track().await?;
//! let outcome = run.await??;
//! ```

/// Cooperative cancellation shared between tasks.
pub mod cancel;

/// Configuration structures for the scheduler and the evaluator.
///
/// [`SchedulerConfig`] caps concurrency and sets the runtime check cadence;
/// [`EvaluatorConfig`] tunes batching, heartbeats and closing.
pub mod config;

/// Compute backend abstraction.
///
/// The `driver` module defines the [`Driver`] trait the scheduler submits
/// through, the [`DriverEvent`] notifications a backend reports back, and the
/// [`RunValidator`] hook run on finished realizations.
pub mod driver;

/// Error types, one per failure domain.
pub mod error;

/// Wire events and in-process fan-out.
///
/// - [`Event`] - every event exchanged between peers
/// - [`EventBus`] - broadcast of the evaluator's outbound events
pub mod events;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
pub mod metrics;

/// The observer side of the protocol.
pub mod monitor;

/// Connection bookkeeping for workers and monitors.
pub mod peers;

/// Frame types and the length-prefixed codec.
pub mod protocol;

/// Realization definitions and lifecycle states.
pub mod realization;

/// Evaluator runtime and transports.
///
/// The `runtime` module provides the [`Evaluator`] coordinator and the ways
/// peers reach it:
/// - [`EvaluatorBuilder`] - assembles an evaluator and its scheduler
/// - [`EvaluatorHandle`] - cloneable handle for attaching peers
/// - [`PeerLink`] - in-process transport
/// - [`serve_tcp`] and [`bridge`] - the TCP transport
pub mod runtime;

/// Concurrency-capped realization scheduling.
pub mod scheduler;

/// Aggregated ensemble status and deltas.
pub mod snapshot;

/// Per-realization lifecycle.
pub mod state_machine;

/// State histograms.
pub mod status;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

pub use cancel::CancelToken;
pub use config::*;
pub use driver::*;
pub use error::*;
pub use events::*;
pub use monitor::{Monitor, SnapshotReplica};
pub use peers::{ExpiredPeer, PeerRegistry, PeerState};
pub use protocol::{Envelope, Frame, PeerRole};
pub use realization::*;
pub use runtime::{
    bridge, serve_tcp, Evaluator, EvaluatorBuilder, EvaluatorHandle, EvaluatorState, PeerLink,
    PeerSender,
};
pub use scheduler::{ExecuteOutcome, Scheduler, SchedulerHandle, SchedulerUpdate};
pub use snapshot::*;
pub use state_machine::*;
pub use status::*;
