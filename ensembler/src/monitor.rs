//! Observer side of the protocol.
//!
//! A [`Monitor`] connects through a [`PeerLink`], keeps a [`SnapshotReplica`]
//! in step with the evaluator's canonical snapshot, answers heartbeats and can
//! ask the evaluator to cancel the iteration.

use std::collections::BTreeMap;

use crate::error::{MonitorError, OrderingViolation, ProtocolError};
use crate::events::Event;
use crate::protocol::{Frame, PeerRole};
use crate::runtime::PeerLink;
use crate::snapshot::{MergeOutcome, PartialSnapshot, Snapshot};

/// Monitor-side copies of the evaluator's snapshot, one per iteration.
#[derive(Clone, Debug, Default)]
pub struct SnapshotReplica {
    iterations: BTreeMap<u32, Snapshot>,
}

impl SnapshotReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the replica of `iteration`.
    pub fn apply_full(&mut self, iteration: u32, snapshot: Snapshot) {
        self.iterations.insert(iteration, snapshot);
    }

    /// Merge a delta into the replica of `iteration`, which must already hold
    /// a full snapshot.
    pub fn apply_partial(
        &mut self,
        iteration: u32,
        delta: &PartialSnapshot,
    ) -> Result<MergeOutcome, OrderingViolation> {
        let snapshot = self
            .iterations
            .get_mut(&iteration)
            .ok_or(OrderingViolation { iteration })?;
        Ok(snapshot.merge(delta))
    }

    pub fn get(&self, iteration: u32) -> Option<&Snapshot> {
        self.iterations.get(&iteration)
    }

    pub fn iterations(&self) -> impl Iterator<Item = u32> + '_ {
        self.iterations.keys().copied()
    }
}

/// Protocol client for an observer of one evaluator.
#[derive(Debug)]
pub struct Monitor {
    link: PeerLink,
    replica: SnapshotReplica,
    last_seq: Option<u64>,
    terminated: bool,
}

impl Monitor {
    /// Send `CONNECT` as a monitor over `link`.
    pub fn connect(link: PeerLink) -> Result<Self, ProtocolError> {
        link.connect(PeerRole::Monitor)?;
        Ok(Self {
            link,
            replica: SnapshotReplica::new(),
            last_seq: None,
            terminated: false,
        })
    }

    pub fn identity(&self) -> &str {
        self.link.identity()
    }

    pub fn replica(&self) -> &SnapshotReplica {
        &self.replica
    }

    /// True once `ensemble.terminated` has been received.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Next new event from the evaluator, already applied to the replica.
    ///
    /// Every event is acknowledged; replays are skipped. Returns `Ok(None)`
    /// when the evaluator closed the link.
    pub async fn next_event(&mut self) -> Result<Option<Event>, MonitorError> {
        loop {
            let Some(frame) = self.link.recv().await else {
                return Ok(None);
            };
            match frame {
                Frame::Heartbeat => self.link.heartbeat()?,
                Frame::Event { seq, event } => {
                    self.link.ack(seq)?;
                    if self.last_seq.is_some_and(|last| seq <= last) {
                        tracing::debug!(
                            identity = %self.identity(),
                            seq = seq,
                            "skipping replayed event"
                        );
                        continue;
                    }
                    self.last_seq = Some(seq);
                    self.apply(&event)?;
                    return Ok(Some(event));
                }
                other => {
                    tracing::debug!(
                        identity = %self.identity(),
                        frame = other.kind(),
                        "ignoring frame"
                    );
                }
            }
        }
    }

    fn apply(&mut self, event: &Event) -> Result<(), OrderingViolation> {
        match event {
            Event::FullSnapshot {
                iteration,
                snapshot,
            } => self.replica.apply_full(*iteration, snapshot.clone()),
            Event::SnapshotUpdate { iteration, delta } => {
                self.replica.apply_partial(*iteration, delta)?;
            }
            Event::Terminated { .. } => self.terminated = true,
            _ => {}
        }
        Ok(())
    }

    /// Ask the evaluator to cancel the iteration.
    pub fn signal_cancel(&mut self) -> Result<(), ProtocolError> {
        self.link.send_event(Event::UserCancel).map(|_| ())
    }

    /// Let the evaluator close.
    pub fn signal_done(&mut self) -> Result<(), ProtocolError> {
        self.link.send_event(Event::UserDone).map(|_| ())
    }

    /// Follow the evaluator until `ensemble.terminated`, then signal done.
    ///
    /// Returns every new event received, in order.
    pub async fn track(&mut self) -> Result<Vec<Event>, MonitorError> {
        let mut events = Vec::new();
        while !self.terminated {
            match self.next_event().await? {
                Some(event) => events.push(event),
                None => break,
            }
        }
        if self.terminated {
            self.signal_done()?;
        }
        Ok(events)
    }

    /// Send `DISCONNECT` and release the link.
    pub fn disconnect(self) -> Result<(), ProtocolError> {
        self.link.disconnect()
    }
}
