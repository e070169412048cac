use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

use crate::realization::{Iens, StepId};
use crate::snapshot::{EnsembleStatus, PartialSnapshot, Snapshot};

/// Every event exchanged between workers, the evaluator and monitors.
///
/// The `type` tag on the wire is the dotted name shown on each variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// A forward-model step was launched.
    #[serde(rename = "fm_step.start")]
    StepStarted {
        real: Iens,
        step: StepId,
        name: String,
        #[serde(default)]
        stdout: Option<PathBuf>,
        #[serde(default)]
        stderr: Option<PathBuf>,
        time: DateTime<Utc>,
    },
    /// Periodic resource report from a running step.
    #[serde(rename = "fm_step.running")]
    StepRunning {
        real: Iens,
        step: StepId,
        #[serde(default)]
        current_memory_usage: Option<u64>,
        #[serde(default)]
        max_memory_usage: Option<u64>,
        #[serde(default)]
        cpu_seconds: Option<f64>,
        time: DateTime<Utc>,
    },
    /// A step exited. Non-zero `exit_code` or an `error` marks it failed.
    #[serde(rename = "fm_step.end")]
    StepEnded {
        real: Iens,
        step: StepId,
        exit_code: i32,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        cpu_seconds: Option<f64>,
        #[serde(default)]
        max_memory_usage: Option<u64>,
        time: DateTime<Utc>,
    },
    /// Checksum of the files a step produced.
    #[serde(rename = "fm_step.checksum")]
    StepChecksum {
        real: Iens,
        step: StepId,
        checksum: String,
        time: DateTime<Utc>,
    },
    /// Complete snapshot, sent to each monitor when it connects.
    #[serde(rename = "ensemble.full_snapshot")]
    FullSnapshot { iteration: u32, snapshot: Snapshot },
    /// Merged delta broadcast after every flush.
    #[serde(rename = "ensemble.partial_snapshot")]
    SnapshotUpdate {
        iteration: u32,
        delta: PartialSnapshot,
    },
    /// Last event of an iteration. `failure` is set when the run failed.
    #[serde(rename = "ensemble.terminated")]
    Terminated {
        iteration: u32,
        #[serde(default)]
        failure: Option<String>,
    },
    /// Every realization reached a terminal state.
    #[serde(rename = "ensemble.done")]
    Done {
        iteration: u32,
        status: EnsembleStatus,
    },
    /// A monitor asks the evaluator to cancel the iteration.
    #[serde(rename = "ee.user_cancel")]
    UserCancel,
    /// A monitor has seen the terminal event and lets the evaluator close.
    #[serde(rename = "ee.user_done")]
    UserDone,
}

impl Event {
    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::StepStarted { .. } => "fm_step.start",
            Event::StepRunning { .. } => "fm_step.running",
            Event::StepEnded { .. } => "fm_step.end",
            Event::StepChecksum { .. } => "fm_step.checksum",
            Event::FullSnapshot { .. } => "ensemble.full_snapshot",
            Event::SnapshotUpdate { .. } => "ensemble.partial_snapshot",
            Event::Terminated { .. } => "ensemble.terminated",
            Event::Done { .. } => "ensemble.done",
            Event::UserCancel => "ee.user_cancel",
            Event::UserDone => "ee.user_done",
        }
    }

    /// Realization a step event reports on.
    pub fn real(&self) -> Option<Iens> {
        match self {
            Event::StepStarted { real, .. }
            | Event::StepRunning { real, .. }
            | Event::StepEnded { real, .. }
            | Event::StepChecksum { real, .. } => Some(*real),
            _ => None,
        }
    }

    /// Iteration an ensemble-level event belongs to.
    pub fn iteration(&self) -> Option<u32> {
        match self {
            Event::FullSnapshot { iteration, .. }
            | Event::SnapshotUpdate { iteration, .. }
            | Event::Terminated { iteration, .. }
            | Event::Done { iteration, .. } => Some(*iteration),
            _ => None,
        }
    }
}

/// In-process fan-out of the evaluator's outbound events.
///
/// Lets observers living in the same process follow an iteration without
/// going through the CONNECT handshake. Publishing never blocks; a subscriber
/// that falls more than `capacity` events behind receives
/// `RecvError::Lagged` and should rebuild from a full snapshot.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers. Dropped silently when there are none.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn terminated(iteration: u32) -> Event {
        Event::Terminated {
            iteration,
            failure: None,
        }
    }

    #[test]
    fn test_wire_tags() {
        let event = Event::StepStarted {
            real: Iens(3),
            step: StepId(0),
            name: "poly_eval".into(),
            stdout: None,
            stderr: None,
            time: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "fm_step.start");
        assert_eq!(json["real"], 3);
        assert_eq!(event.kind(), "fm_step.start");
        assert_eq!(event.real(), Some(Iens(3)));

        let cancel = serde_json::to_string(&Event::UserCancel).unwrap();
        assert_eq!(cancel, r#"{"type":"ee.user_cancel"}"#);
    }

    #[test]
    fn test_snapshot_event_survives_tagged_roundtrip() {
        let mut snapshot = Snapshot::new();
        let mut delta = PartialSnapshot::new();
        delta.update_step(
            Iens(11),
            StepId(2),
            &crate::snapshot::StepSnapshot {
                name: Some("flow".into()),
                ..Default::default()
            },
        );
        snapshot.merge(&delta);

        let event = Event::FullSnapshot {
            iteration: 1,
            snapshot,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{"type":"fm_step.end","real":"0","step":1,"exit_code":0,
            "time":"2024-01-01T00:00:00Z"}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        match event {
            Event::StepEnded {
                real,
                step,
                error,
                cpu_seconds,
                ..
            } => {
                assert_eq!(real, Iens(0));
                assert_eq!(step, StepId(1));
                assert!(error.is_none());
                assert!(cpu_seconds.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bus_broadcasts_to_all_subscribers() {
        let bus = EventBus::new(16);
        assert_eq!(bus.subscriber_count(), 0);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        for i in 0..3 {
            bus.publish(terminated(i));
        }

        for i in 0..3 {
            let e1 = timeout(Duration::from_millis(100), rx1.recv())
                .await
                .unwrap()
                .unwrap();
            let e2 = timeout(Duration::from_millis(100), rx2.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(e1.iteration(), Some(i));
            assert_eq!(e2.iteration(), Some(i));
        }

        drop(rx2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(terminated(i));
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[test]
    fn test_bus_debug_format() {
        let bus = EventBus::new(8);
        let _rx = bus.subscribe();
        let debug = format!("{:?}", bus);
        assert!(debug.contains("capacity: 8"));
        assert!(debug.contains("subscribers: 1"));
    }
}
