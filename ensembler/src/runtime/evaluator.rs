use std::any::type_name;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::EvaluatorConfig;
use crate::driver::Driver;
use crate::error::{EvaluationError, ProtocolError};
use crate::events::{Event, EventBus};
use crate::peers::PeerRegistry;
use crate::protocol::{Envelope, Frame, PeerRole};
use crate::realization::{detect_overspent_cpu, Iens, Realization};
use crate::scheduler::{ExecuteOutcome, Scheduler, SchedulerHandle, SchedulerUpdate};
use crate::snapshot::{EnsembleStatus, MergeOutcome, PartialSnapshot, Snapshot};
use crate::telemetry;

use super::link::PeerLink;

/// Lifecycle of an [`Evaluator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EvaluatorState {
    /// Built, `run` not yet called.
    Starting,
    /// Scheduler running, events flowing.
    Running,
    /// Terminal events sent; waiting for monitors to acknowledge with `ee.user_done`.
    Stopping,
    Done,
}

/// Everything the evaluator task consumes, on one ordered queue.
#[derive(Debug)]
pub(crate) enum Inbound {
    Attach {
        identity: String,
        link_id: Uuid,
        outbound: mpsc::UnboundedSender<Frame>,
    },
    Frame(Envelope),
    Detach {
        identity: String,
        link_id: Uuid,
    },
    Scheduler(SchedulerUpdate),
    SchedulerDone(anyhow::Result<ExecuteOutcome>),
}

struct Attachment {
    link_id: Uuid,
    outbound: mpsc::UnboundedSender<Frame>,
    next_seq: u64,
}

/// Cloneable handle to a running [`Evaluator`].
#[derive(Clone, Debug)]
pub struct EvaluatorHandle {
    inbound: mpsc::UnboundedSender<Inbound>,
    state: watch::Receiver<EvaluatorState>,
    snapshot: watch::Receiver<Snapshot>,
    scheduler: SchedulerHandle,
    bus: Arc<EventBus>,
    max_frame_bytes: usize,
}

impl EvaluatorHandle {
    /// Open a transport for the peer called `identity`. A later attach under
    /// the same identity replaces this one.
    pub fn attach(&self, identity: impl Into<String>) -> PeerLink {
        let identity = identity.into();
        let link_id = Uuid::now_v7();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let _ = self.inbound.send(Inbound::Attach {
            identity: identity.clone(),
            link_id,
            outbound,
        });
        PeerLink::new(identity, link_id, self.inbound.clone(), outbound_rx)
    }

    pub fn state(&self) -> EvaluatorState {
        *self.state.borrow()
    }

    /// Wait until the evaluator has reached `state` or a later one.
    pub async fn wait_for_state(&self, state: EvaluatorState) -> anyhow::Result<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current >= state)
            .await
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("evaluator dropped before reaching {state:?}"))
    }

    /// Copy of the canonical snapshot as of the last flush.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    /// Cancel the iteration, exactly as a monitor's `ee.user_cancel` would.
    pub fn cancel(&self) {
        self.scheduler.cancel();
    }

    /// In-process stream of every event broadcast to monitors.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

/// Coordinator of one ensemble iteration.
///
/// Owns the canonical [`Snapshot`] and is its only writer. Worker step
/// events and scheduler records are turned into deltas, batched, merged and
/// broadcast to every connected monitor. When the scheduler finishes the
/// evaluator publishes the final status, `ensemble.done` and then
/// `ensemble.terminated`, and closes once every monitor has answered with
/// `ee.user_done` or the close timeout has passed.
pub struct Evaluator<D: Driver + 'static> {
    config: EvaluatorConfig,
    scheduler: Option<Scheduler<D>>,
    scheduler_handle: SchedulerHandle,
    realizations: BTreeMap<Iens, Realization>,
    snapshot: Snapshot,
    peers: PeerRegistry,
    attachments: HashMap<String, Attachment>,
    done_monitors: HashSet<String>,
    batch: Vec<PartialSnapshot>,
    final_events: Vec<Event>,
    completion: Option<Result<ExecuteOutcome, EvaluationError>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    state: watch::Sender<EvaluatorState>,
    snapshot_tx: watch::Sender<Snapshot>,
    bus: Arc<EventBus>,
}

impl<D: Driver + 'static> fmt::Debug for Evaluator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("config", &self.config)
            .field("driver_type", &type_name::<D>())
            .field("realizations", &self.realizations.len())
            .field("state", &*self.state.borrow())
            .field("attachments", &self.attachments.len())
            .finish()
    }
}

impl<D: Driver + 'static> Evaluator<D> {
    pub fn new(
        config: EvaluatorConfig,
        scheduler: Scheduler<D>,
        scheduler_handle: SchedulerHandle,
        realizations: impl IntoIterator<Item = Realization>,
    ) -> (Self, EvaluatorHandle) {
        let realizations: BTreeMap<Iens, Realization> = realizations
            .into_iter()
            .map(|real| (real.iens, real))
            .collect();
        let snapshot = Snapshot::from_realizations(realizations.values());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(EvaluatorState::Starting);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        let bus = Arc::new(EventBus::new(config.broadcast_capacity));

        let handle = EvaluatorHandle {
            inbound: inbound_tx.clone(),
            state: state_rx,
            snapshot: snapshot_rx,
            scheduler: scheduler_handle.clone(),
            bus: Arc::clone(&bus),
            max_frame_bytes: config.max_frame_bytes,
        };
        let evaluator = Self {
            peers: PeerRegistry::new(config.heartbeat_timeout()),
            config,
            scheduler: Some(scheduler),
            scheduler_handle,
            realizations,
            snapshot,
            attachments: HashMap::new(),
            done_monitors: HashSet::new(),
            batch: Vec::new(),
            final_events: Vec::new(),
            completion: None,
            inbound_tx,
            inbound_rx,
            state,
            snapshot_tx,
            bus,
        };
        (evaluator, handle)
    }

    /// Run the iteration to completion.
    ///
    /// Returns the scheduler's outcome, or the ensemble-fatal error that was
    /// reported to monitors as a failed `ensemble.terminated`.
    pub async fn run(mut self) -> Result<ExecuteOutcome, EvaluationError> {
        let Some(scheduler) = self.scheduler.take() else {
            return Err(EvaluationError::Interrupted);
        };
        let iteration = self.config.iteration;
        tracing::info!(
            ensemble_id = %self.config.ensemble_id,
            iteration = iteration,
            realizations = self.realizations.len(),
            "evaluator starting"
        );

        self.batch
            .push(PartialSnapshot::new().with_status(EnsembleStatus::Started));
        self.flush();
        self.spawn_scheduler(scheduler);
        self.state.send_replace(EvaluatorState::Running);

        let mut batch_tick = tokio::time::interval(self.config.batching_interval());
        batch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut close_deadline: Option<Instant> = None;
        let close_wait = |deadline: Option<Instant>| {
            tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now))
        };

        loop {
            tokio::select! {
                Some(message) = self.inbound_rx.recv() => self.handle_inbound(message),
                _ = batch_tick.tick() => self.flush(),
                _ = heartbeat_tick.tick() => self.on_heartbeat_tick(),
                _ = close_wait(close_deadline), if close_deadline.is_some() => {
                    let monitors = self.peers.count(PeerRole::Monitor);
                    tracing::warn!(
                        waiting_for = monitors - self.connected_done_monitors(),
                        "closing without ee.user_done from every monitor"
                    );
                    break;
                }
            }

            if self.completion.is_some() {
                if close_deadline.is_none() {
                    close_deadline = Some(Instant::now() + self.config.close_timeout());
                }
                if self.connected_done_monitors() == self.peers.count(PeerRole::Monitor) {
                    break;
                }
            }
        }

        self.flush();
        self.state.send_replace(EvaluatorState::Done);
        tracing::info!(iteration = iteration, status = %self.snapshot.status(), "evaluator done");
        self.completion.unwrap_or(Err(EvaluationError::Interrupted))
    }

    fn spawn_scheduler(&self, scheduler: Scheduler<D>) {
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let scheduler = scheduler.with_updates(updates_tx);
        let min_required = self.config.min_required;
        let inbound = self.inbound_tx.clone();

        tokio::spawn(async move {
            let execution = tokio::spawn(scheduler.execute(min_required));
            // The scheduler owns the only sender, so this ends when it finishes
            // and every record is forwarded before the completion below.
            while let Some(update) = updates_rx.recv().await {
                let _ = inbound.send(Inbound::Scheduler(update));
            }
            let result = match execution.await {
                Ok(result) => result,
                Err(join) => Err(anyhow::anyhow!("scheduler task failed: {join}")),
            };
            let _ = inbound.send(Inbound::SchedulerDone(result));
        });
    }

    fn handle_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Attach {
                identity,
                link_id,
                outbound,
            } => {
                tracing::debug!(identity = %identity, "transport attached");
                self.attachments.insert(
                    identity,
                    Attachment {
                        link_id,
                        outbound,
                        next_seq: 0,
                    },
                );
            }
            Inbound::Detach { identity, link_id } => {
                if self
                    .attachments
                    .get(&identity)
                    .is_some_and(|attachment| attachment.link_id == link_id)
                {
                    tracing::debug!(identity = %identity, "transport detached");
                    self.attachments.remove(&identity);
                }
            }
            Inbound::Frame(envelope) => self.handle_frame(envelope),
            Inbound::Scheduler(SchedulerUpdate::StateChange(transition)) => {
                self.push_delta(PartialSnapshot::from_state_change(&transition));
            }
            Inbound::Scheduler(SchedulerUpdate::Timeout { iens, at }) => {
                self.flush();
                self.push_delta(PartialSnapshot::realization_timeout(iens, &self.snapshot, at));
            }
            Inbound::SchedulerDone(result) => self.complete(result),
        }
    }

    fn handle_frame(&mut self, envelope: Envelope) {
        let Envelope { identity, frame } = envelope;
        let now = Instant::now();

        if let Frame::Connect {
            identity: claimed,
            role,
        } = &frame
        {
            if *claimed != identity {
                telemetry::record_protocol_error(
                    &identity,
                    &ProtocolError::IdentityMismatch {
                        attached: identity.clone(),
                        claimed: claimed.clone(),
                    },
                );
                return;
            }
            self.on_connect(&identity, *role, now);
            return;
        }

        let Some(role) = self.peers.role(&identity) else {
            telemetry::record_protocol_error(
                &identity,
                &ProtocolError::NotConnected(identity.clone()),
            );
            return;
        };
        self.peers.touch(&identity, now);

        match frame {
            Frame::Connect { .. } => {}
            Frame::Disconnect => {
                let _span = telemetry::peer_span(&identity, role).entered();
                tracing::info!("peer disconnected");
                self.peers.disconnect(&identity);
                self.update_peer_gauges();
            }
            Frame::Heartbeat => {}
            Frame::Ack { event_id } => self.peers.record_ack(&identity, event_id),
            Frame::Event { seq, event } => {
                let duplicate = self.peers.observe_sequence(&identity, seq);
                self.send_frame(&identity, Frame::Ack { event_id: seq });
                match duplicate {
                    Ok(()) => self.apply_event(&identity, role, event),
                    Err(err) => tracing::debug!(identity = %identity, "{err}"),
                }
            }
        }
    }

    fn on_connect(&mut self, identity: &str, role: PeerRole, now: Instant) {
        let session = self.peers.connect(identity, role, now).session;
        let _span = telemetry::peer_span(identity, role).entered();
        tracing::info!(session = %session, "peer connected");
        self.update_peer_gauges();

        if role == PeerRole::Monitor {
            self.flush();
            self.send_event(
                identity,
                Event::FullSnapshot {
                    iteration: self.config.iteration,
                    snapshot: self.snapshot.clone(),
                },
            );
            for event in self.final_events.clone() {
                self.send_event(identity, event);
            }
        }
    }

    fn apply_event(&mut self, identity: &str, role: PeerRole, event: Event) {
        match (role, event) {
            (PeerRole::Monitor, Event::UserCancel) => {
                tracing::info!(identity = %identity, "cancel requested by monitor");
                self.scheduler_handle.cancel();
            }
            (PeerRole::Monitor, Event::UserDone) => {
                tracing::debug!(identity = %identity, "monitor done");
                self.done_monitors.insert(identity.to_string());
            }
            (PeerRole::Worker, event) => {
                let Some(delta) = PartialSnapshot::from_step_event(&event) else {
                    telemetry::record_protocol_error(
                        identity,
                        &ProtocolError::UnexpectedEvent {
                            identity: identity.to_string(),
                            event: event.kind(),
                        },
                    );
                    return;
                };
                if let Some(iens) = event.real() {
                    self.peers.attribute(identity, iens);
                }
                self.push_delta(delta);
            }
            (PeerRole::Monitor, event) => telemetry::record_protocol_error(
                identity,
                &ProtocolError::UnexpectedEvent {
                    identity: identity.to_string(),
                    event: event.kind(),
                },
            ),
        }
    }

    fn push_delta(&mut self, delta: PartialSnapshot) {
        self.batch.push(delta);
        if self.batch.len() >= self.config.max_batch_size {
            self.flush();
        }
    }

    /// Merge the buffered deltas as one and broadcast the result.
    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch_len = self.batch.len();
        let mut merged = PartialSnapshot::new();
        for delta in self.batch.drain(..) {
            merged.merge(&delta);
        }

        let iteration = self.config.iteration;
        let outcome = {
            let _span = telemetry::merge_span(iteration, batch_len).entered();
            self.snapshot.merge(&merged)
        };
        telemetry::record_snapshot_merge(iteration, outcome.as_str(), batch_len);
        if outcome != MergeOutcome::Applied {
            return;
        }

        self.snapshot_tx.send_modify(|snapshot| {
            snapshot.merge(&merged);
        });
        self.broadcast(Event::SnapshotUpdate {
            iteration,
            delta: merged,
        });
    }

    fn on_heartbeat_tick(&mut self) {
        self.flush();

        let now = Instant::now();
        let at = Utc::now();
        for peer in self.peers.expire(now) {
            telemetry::record_heartbeat_timeout(&peer.identity, peer.role, peer.realizations.len());
            self.attachments.remove(&peer.identity);
            if peer.role != PeerRole::Worker {
                continue;
            }
            for iens in &peer.realizations {
                let lost = PartialSnapshot::lost_worker(*iens, &peer.identity, &self.snapshot, at);
                if let Some(delta) = lost {
                    self.batch.push(delta);
                }
            }
        }
        self.update_peer_gauges();
        self.flush();

        for monitor in self.peers.monitors() {
            self.send_frame(&monitor, Frame::Heartbeat);
        }
    }

    fn complete(&mut self, result: anyhow::Result<ExecuteOutcome>) {
        self.flush();
        let iteration = self.config.iteration;

        match result {
            Ok(outcome) => {
                let status = if outcome.cancelled {
                    EnsembleStatus::Cancelled
                } else if outcome.is_success() {
                    EnsembleStatus::Stopped
                } else {
                    EnsembleStatus::Failed
                };
                self.batch.push(PartialSnapshot::new().with_status(status));
                self.flush();
                self.log_resource_usage();

                let failure = (status == EnsembleStatus::Failed).then(|| {
                    format!(
                        "{} of the {} required realizations succeeded",
                        outcome.successful, outcome.min_required
                    )
                });
                tracing::info!(
                    iteration = iteration,
                    status = %status,
                    histogram = %outcome.histogram,
                    "ensemble finished"
                );
                self.finish_with(vec![
                    Event::Done { iteration, status },
                    Event::Terminated { iteration, failure },
                ]);
                self.completion = Some(Ok(outcome));
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(iteration = iteration, "ensemble evaluation failed: {message}");
                self.batch
                    .push(PartialSnapshot::new().with_status(EnsembleStatus::Failed));
                self.flush();
                self.finish_with(vec![Event::Terminated {
                    iteration,
                    failure: Some(message.clone()),
                }]);
                self.completion = Some(Err(EvaluationError::Scheduler(message)));
            }
        }
        self.state.send_replace(EvaluatorState::Stopping);
    }

    fn finish_with(&mut self, events: Vec<Event>) {
        for event in &events {
            self.broadcast(event.clone());
        }
        self.final_events = events;
    }

    fn log_resource_usage(&self) {
        if let Some((iens, step, bytes)) = self.snapshot.max_memory_usage() {
            tracing::info!(
                iens = %iens,
                step = %step,
                max_memory_bytes = bytes,
                "highest memory usage reported by a forward model step"
            );
        }
        for (iens, real) in self.snapshot.reals() {
            let num_cpu = self.realizations.get(iens).map_or(1, |r| r.num_cpu);
            for step in real.steps.values() {
                let (Some(cpu_seconds), Some(duration)) = (step.cpu_seconds, step.duration()) else {
                    continue;
                };
                let name = step.name.as_deref().unwrap_or("unnamed");
                let overspent = detect_overspent_cpu(num_cpu, *iens, name, cpu_seconds, duration);
                if let Some(message) = overspent {
                    tracing::warn!("{message}");
                }
            }
        }
    }

    fn broadcast(&mut self, event: Event) {
        for monitor in self.peers.monitors() {
            self.send_event(&monitor, event.clone());
        }
        self.bus.publish(event);
    }

    fn send_event(&mut self, identity: &str, event: Event) {
        let Some(attachment) = self.attachments.get_mut(identity) else {
            return;
        };
        attachment.next_seq += 1;
        let seq = attachment.next_seq;
        self.send_frame(identity, Frame::Event { seq, event });
    }

    fn send_frame(&mut self, identity: &str, frame: Frame) {
        let Some(attachment) = self.attachments.get(identity) else {
            return;
        };
        if attachment.outbound.send(frame).is_err() {
            tracing::debug!(identity = %identity, "transport gone, dropping attachment");
            self.attachments.remove(identity);
        }
    }

    fn connected_done_monitors(&self) -> usize {
        self.peers
            .monitors()
            .iter()
            .filter(|identity| self.done_monitors.contains(*identity))
            .count()
    }

    fn update_peer_gauges(&self) {
        telemetry::set_connected_peers(PeerRole::Worker, self.peers.count(PeerRole::Worker));
        telemetry::set_connected_peers(PeerRole::Monitor, self.peers.count(PeerRole::Monitor));
    }
}
