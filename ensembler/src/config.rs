use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Configuration for the realization scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of realizations submitted, pending, running or being
    /// killed at the same time (0 = unlimited).
    pub max_running: usize,
    /// How often running realizations are checked against their `max_runtime`,
    /// in milliseconds.
    pub runtime_check_interval_ms: u64,
}

impl SchedulerConfig {
    pub fn new(max_running: usize) -> Self {
        Self {
            max_running,
            ..Self::default()
        }
    }

    /// Set the concurrency cap.
    pub fn with_max_running(mut self, max_running: usize) -> Self {
        self.max_running = max_running;
        self
    }

    /// Set the runtime check interval.
    pub fn with_runtime_check_interval(mut self, ms: u64) -> Self {
        self.runtime_check_interval_ms = ms.max(1);
        self
    }

    pub fn runtime_check_interval(&self) -> Duration {
        Duration::from_millis(self.runtime_check_interval_ms.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_running: 0,
            runtime_check_interval_ms: 1000,
        }
    }
}

/// Configuration for the evaluator coordinating one ensemble iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Identifier of the ensemble, used in logs and spans.
    pub ensemble_id: String,
    /// Iteration number stamped on every snapshot event.
    pub iteration: u32,
    /// Realizations that must succeed for the iteration to count as a
    /// success. `None` requires every active realization.
    pub min_required: Option<usize>,
    /// Interval between heartbeats sent to monitors and liveness sweeps, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a peer is treated as disconnected, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Interval at which buffered deltas are merged and broadcast, in milliseconds.
    pub batching_interval_ms: u64,
    /// Buffered deltas that force an early flush.
    pub max_batch_size: usize,
    /// How long the evaluator waits for monitors to acknowledge completion
    /// with `ee.user_done` before closing, in milliseconds.
    pub close_timeout_ms: u64,
    /// Largest accepted wire frame, in bytes.
    pub max_frame_bytes: usize,
    /// Events buffered per in-process subscriber before it starts lagging.
    pub broadcast_capacity: usize,
}

impl EvaluatorConfig {
    pub fn new(ensemble_id: impl Into<String>, iteration: u32) -> Self {
        Self {
            ensemble_id: ensemble_id.into(),
            iteration,
            ..Self::default()
        }
    }

    pub fn with_min_required(mut self, min_required: usize) -> Self {
        self.min_required = Some(min_required);
        self
    }

    pub fn with_heartbeat_interval(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_heartbeat_timeout(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_batching_interval(mut self, ms: u64) -> Self {
        self.batching_interval_ms = ms;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_close_timeout(mut self, ms: u64) -> Self {
        self.close_timeout_ms = ms;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn batching_interval(&self) -> Duration {
        Duration::from_millis(self.batching_interval_ms.max(1))
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            ensemble_id: "ensemble".to_string(),
            iteration: 0,
            min_required: None,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 5000,
            batching_interval_ms: 500,
            max_batch_size: 500,
            close_timeout_ms: 5000,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            broadcast_capacity: 1024,
        }
    }
}
