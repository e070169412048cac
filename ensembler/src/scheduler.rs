use std::any::type_name;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::cancel::CancelToken;
use crate::config::SchedulerConfig;
use crate::driver::{AcceptAll, Driver, DriverEvent, DriverEventKind, RunValidator};
use crate::realization::{Iens, Realization, RealizationState};
use crate::state_machine::{RealizationStateMachine, Transition};
use crate::status::StateHistogram;
use crate::telemetry::{instrument_driver_call, realization_span};

/// Records the scheduler forwards to whoever owns the ensemble snapshot.
#[derive(Clone, Debug, PartialEq)]
pub enum SchedulerUpdate {
    /// A realization entered an observable state.
    StateChange(Transition),
    /// A realization exceeded its `max_runtime` and is being killed.
    Timeout { iens: Iens, at: DateTime<Utc> },
}

/// Summary returned by [`Scheduler::execute`].
#[derive(Clone, Debug)]
pub struct ExecuteOutcome {
    /// Final state counts.
    pub histogram: StateHistogram,
    /// Realizations that reached `SUCCESS`.
    pub successful: usize,
    /// Successes needed for the iteration to count as a success.
    pub min_required: usize,
    /// Admission stopped before every realization was attempted.
    pub stopped_early: bool,
    /// The run was cancelled through the cancel token.
    pub cancelled: bool,
}

impl ExecuteOutcome {
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.successful >= self.min_required
    }
}

#[derive(Debug)]
enum Command {
    KillAll { ack: oneshot::Sender<()> },
}

// Results of spawned driver and validator calls.
enum TaskResult {
    Submitted { iens: Iens, result: anyhow::Result<()> },
    Killed { iens: Iens, result: anyhow::Result<()> },
    Validated { iens: Iens, result: anyhow::Result<()> },
}

/// Cloneable control surface of a running [`Scheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    states: watch::Receiver<StateHistogram>,
    cancel: CancelToken,
}

impl SchedulerHandle {
    /// Histogram of realization states as of the scheduler's last step.
    pub fn count_states(&self) -> StateHistogram {
        self.states.borrow().clone()
    }

    /// Receiver notified whenever the histogram changes.
    pub fn state_changes(&self) -> watch::Receiver<StateHistogram> {
        self.states.clone()
    }

    /// Kill every non-terminal realization and wait until the driver has
    /// acknowledged each kill, successfully or not.
    pub async fn kill_all_jobs(&self) -> anyhow::Result<()> {
        let (ack, acked) = oneshot::channel();
        if self.commands.send(Command::KillAll { ack }).is_err() {
            tracing::debug!("kill_all_jobs after the scheduler finished; nothing to kill");
            return Ok(());
        }
        acked
            .await
            .map_err(|_| anyhow!("scheduler stopped before acknowledging kills"))
    }

    /// Stop admitting work and kill what is in flight. Takes effect at the
    /// next admission cycle; driver calls already running are not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

/// Owns the state machines of one iteration and drives them through a
/// [`Driver`].
///
/// All bookkeeping happens on the task running [`Scheduler::execute`]. Driver
/// and validator calls are spawned and report back on an internal channel, so
/// a slow backend never stalls admission or event handling.
pub struct Scheduler<D: Driver + 'static> {
    config: SchedulerConfig,
    machines: BTreeMap<Iens, RealizationStateMachine>,
    driver: Arc<D>,
    validator: Arc<dyn RunValidator>,
    driver_events: mpsc::UnboundedReceiver<DriverEvent>,
    transitions: mpsc::UnboundedReceiver<Transition>,
    commands: mpsc::UnboundedReceiver<Command>,
    tasks_tx: mpsc::UnboundedSender<TaskResult>,
    tasks_rx: mpsc::UnboundedReceiver<TaskResult>,
    states: watch::Sender<StateHistogram>,
    cancel: CancelToken,
    updates: Option<mpsc::UnboundedSender<SchedulerUpdate>>,
    kill_waiters: Vec<oneshot::Sender<()>>,
    outstanding_tasks: usize,
    stopping: bool,
}

impl<D: Driver + 'static> fmt::Debug for Scheduler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("driver_type", &type_name::<D>())
            .field("realizations", &self.machines.len())
            .field("outstanding_tasks", &self.outstanding_tasks)
            .field("stopping", &self.stopping)
            .finish()
    }
}

impl<D: Driver + 'static> Scheduler<D> {
    /// Build a scheduler for `realizations`. Each gets a state machine that is
    /// allocated and, when active, moved to `WAITING`.
    pub fn new(
        config: SchedulerConfig,
        realizations: impl IntoIterator<Item = Realization>,
        driver: Arc<D>,
        driver_events: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> (Self, SchedulerHandle) {
        let (transitions_tx, transitions) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

        let mut machines = BTreeMap::new();
        for realization in realizations {
            let active = realization.active;
            let mut machine = RealizationStateMachine::new(realization, transitions_tx.clone());
            // Fresh machines accept both triggers; the results carry no information.
            let _ = machine.allocate();
            if active {
                let _ = machine.activate();
            }
            machines.insert(machine.iens(), machine);
        }

        let histogram = StateHistogram::from_states(machines.values().map(|m| m.state()));
        let (states, states_rx) = watch::channel(histogram);
        let cancel = CancelToken::new();

        let handle = SchedulerHandle {
            commands: commands_tx,
            states: states_rx,
            cancel: cancel.clone(),
        };
        let scheduler = Self {
            config,
            machines,
            driver,
            validator: Arc::new(AcceptAll),
            driver_events,
            transitions,
            commands,
            tasks_tx,
            tasks_rx,
            states,
            cancel,
            updates: None,
            kill_waiters: Vec::new(),
            outstanding_tasks: 0,
            stopping: false,
        };
        (scheduler, handle)
    }

    /// Replace the default validator, which accepts every finished run.
    pub fn with_validator(mut self, validator: Arc<dyn RunValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Forward state changes and timeouts to `updates`.
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<SchedulerUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn count_states(&self) -> StateHistogram {
        StateHistogram::from_states(self.machines.values().map(|m| m.state()))
    }

    /// Run the iteration to completion.
    ///
    /// `min_required` successes are needed for a successful iteration; `None`
    /// requires every active realization. Admission stops as soon as so many
    /// realizations are lost that `min_required` is out of reach; waiting
    /// realizations are then removed and in-flight ones killed.
    pub async fn execute(mut self, min_required: Option<usize>) -> anyhow::Result<ExecuteOutcome> {
        let active = self.active_count();
        let min_required = min_required.unwrap_or(active);
        if min_required > active {
            bail!("{min_required} successful realizations required but only {active} are active");
        }
        tracing::info!(
            active = active,
            min_required = min_required,
            max_running = self.config.max_running,
            "scheduler starting"
        );

        let mut runtime_tick = tokio::time::interval(self.config.runtime_check_interval());
        runtime_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();
        let mut driver_open = true;
        let mut commands_open = true;

        loop {
            if !self.stopping {
                let lost = self.lost_count();
                if cancel.is_cancelled() {
                    self.begin_stop("cancelled");
                } else if lost > active - min_required {
                    tracing::warn!(
                        lost = lost,
                        min_required = min_required,
                        "too many realizations lost to reach the required successes"
                    );
                    self.begin_stop("minimum unreachable");
                } else {
                    self.admit();
                }
            }

            self.forward_transitions();
            self.publish_states();
            self.answer_kill_waiters();
            if self.outstanding_tasks == 0 && self.all_active_terminal() {
                break;
            }

            tokio::select! {
                event = self.driver_events.recv(), if driver_open => match event {
                    Some(event) => self.on_driver_event(event),
                    None => {
                        tracing::warn!("driver event stream closed");
                        driver_open = false;
                    }
                },
                Some(result) = self.tasks_rx.recv() => self.on_task_result(result),
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::KillAll { ack }) => {
                        if !self.stopping {
                            self.begin_stop("kill_all_jobs");
                        }
                        self.kill_waiters.push(ack);
                    }
                    None => commands_open = false,
                },
                _ = cancel.cancelled(), if !self.stopping => {}
                _ = runtime_tick.tick() => self.check_runtimes(),
            }
        }

        for ack in self.kill_waiters.drain(..) {
            let _ = ack.send(());
        }
        let histogram = self.count_states();
        let successful = histogram.count(RealizationState::Success);
        tracing::info!(histogram = %histogram, "scheduler finished");
        Ok(ExecuteOutcome {
            histogram,
            successful,
            min_required,
            stopped_early: self.stopping,
            cancelled: cancel.is_cancelled(),
        })
    }

    fn active_count(&self) -> usize {
        self.machines
            .values()
            .filter(|m| m.realization().active)
            .count()
    }

    fn lost_count(&self) -> usize {
        self.machines
            .values()
            .filter(|m| m.state().is_lost())
            .count()
    }

    fn all_active_terminal(&self) -> bool {
        self.machines
            .values()
            .filter(|m| m.realization().active)
            .all(|m| m.state().is_terminal())
    }

    fn admit(&mut self) {
        let max_running = self.config.max_running;
        let mut in_flight = self
            .machines
            .values()
            .filter(|m| m.state().is_in_flight())
            .count();
        let waiting: Vec<Iens> = self
            .machines
            .values()
            .filter(|m| m.state() == RealizationState::Waiting)
            .map(|m| m.iens())
            .collect();

        for iens in waiting {
            if max_running != 0 && in_flight >= max_running {
                break;
            }
            let Some(machine) = self.machines.get_mut(&iens) else {
                continue;
            };
            match machine.submit() {
                Ok(_) => {
                    in_flight += 1;
                    self.spawn_submit(iens);
                }
                Err(err) => tracing::warn!("{err}"),
            }
        }
    }

    fn begin_stop(&mut self, reason: &'static str) {
        self.stopping = true;
        tracing::info!(reason = reason, "scheduler stopping admission");

        let iens_list: Vec<Iens> = self.machines.keys().copied().collect();
        for iens in iens_list {
            let Some(machine) = self.machines.get_mut(&iens) else {
                continue;
            };
            match machine.state() {
                RealizationState::Waiting => {
                    if let Err(err) = machine.remove() {
                        tracing::warn!("{err}");
                    }
                }
                RealizationState::Submitted
                | RealizationState::Pending
                | RealizationState::Running => {
                    if machine.dokill().is_ok() {
                        self.spawn_kill(iens);
                    }
                }
                _ => {}
            }
        }
    }

    fn on_driver_event(&mut self, event: DriverEvent) {
        let iens = event.iens;
        let Some(machine) = self.machines.get_mut(&iens) else {
            tracing::warn!(iens = %iens, "driver event for unknown realization");
            return;
        };
        let state = machine.state();
        if state.is_terminal() || state == RealizationState::DoKill {
            tracing::debug!(
                iens = %iens,
                state = %state,
                event = ?event.kind,
                "ignoring stale driver event"
            );
            return;
        }

        let result = match event.kind {
            DriverEventKind::Pending => match state {
                RealizationState::Pending | RealizationState::Running => return,
                _ => machine.accept(),
            },
            DriverEventKind::Running => match state {
                RealizationState::Running => return,
                RealizationState::Submitted => machine.accept().and_then(|_| machine.start()),
                _ => machine.start(),
            },
            DriverEventKind::Done => {
                let result = match state {
                    RealizationState::Submitted => machine
                        .accept()
                        .and_then(|_| machine.start())
                        .and_then(|_| machine.runend()),
                    RealizationState::Pending => machine.start().and_then(|_| machine.runend()),
                    RealizationState::Done => return,
                    _ => machine.runend(),
                };
                if result.is_ok() {
                    self.spawn_validation(iens);
                }
                result
            }
            DriverEventKind::Exit { error } => {
                let result = match state {
                    RealizationState::Submitted => machine.submitfail(error),
                    _ => machine.runfail(error),
                };
                if result == Ok(RealizationState::Submitted) {
                    self.spawn_submit(iens);
                }
                result
            }
        };
        if let Err(err) = result {
            tracing::warn!("{err}");
        }
    }

    fn on_task_result(&mut self, result: TaskResult) {
        self.outstanding_tasks = self.outstanding_tasks.saturating_sub(1);
        match result {
            TaskResult::Submitted { iens, result } => {
                let Err(err) = result else {
                    tracing::debug!(iens = %iens, "driver accepted submission");
                    return;
                };
                let Some(machine) = self.machines.get_mut(&iens) else {
                    return;
                };
                if machine.state() != RealizationState::Submitted {
                    tracing::warn!(
                        iens = %iens,
                        state = %machine.state(),
                        "late submit failure: {err:#}"
                    );
                    return;
                }
                if machine.submitfail(Some(format!("{err:#}"))) == Ok(RealizationState::Submitted) {
                    self.spawn_submit(iens);
                }
            }
            TaskResult::Killed { iens, result } => {
                let Some(machine) = self.machines.get_mut(&iens) else {
                    return;
                };
                if machine.state() != RealizationState::DoKill {
                    return;
                }
                let outcome = match result {
                    Ok(()) => machine.verify_kill(),
                    Err(err) => {
                        tracing::error!(iens = %iens, "driver failed to kill realization: {err:#}");
                        machine.ack_killfailure(Some(format!("{err:#}")))
                    }
                };
                if let Err(err) = outcome {
                    tracing::warn!("{err}");
                }
            }
            TaskResult::Validated { iens, result } => {
                let Some(machine) = self.machines.get_mut(&iens) else {
                    return;
                };
                if machine.state() != RealizationState::Done {
                    return;
                }
                let outcome = match result {
                    Ok(()) => machine.validate(),
                    Err(err) => machine.invalidate(Some(format!("{err:#}"))),
                };
                if let Err(err) = outcome {
                    tracing::warn!("{err}");
                }
            }
        }
    }

    fn check_runtimes(&mut self) {
        let now = Utc::now();
        let mut expired = Vec::new();
        for machine in self.machines.values_mut() {
            if machine.state() != RealizationState::Running {
                continue;
            }
            let Some(max_runtime) = machine.realization().max_runtime else {
                continue;
            };
            let Some(start) = machine.start_time() else {
                let _ = machine.something_went_wrong("running without a recorded start time");
                continue;
            };
            let elapsed = (now - start).to_std().unwrap_or_default();
            if elapsed > max_runtime {
                expired.push(machine.iens());
            }
        }

        for iens in expired {
            tracing::warn!(iens = %iens, "realization exceeded its maximum runtime, killing");
            if let Some(updates) = &self.updates {
                let _ = updates.send(SchedulerUpdate::Timeout { iens, at: now });
            }
            let killing = self
                .machines
                .get_mut(&iens)
                .is_some_and(|machine| machine.dokill().is_ok());
            if killing {
                self.spawn_kill(iens);
            }
        }
    }

    fn spawn_submit(&mut self, iens: Iens) {
        let Some(machine) = self.machines.get(&iens) else {
            return;
        };
        let realization = machine.realization().clone();
        let attempt = realization.max_retries - machine.retries_left();
        let driver = Arc::clone(&self.driver);
        let tasks = self.tasks_tx.clone();
        self.outstanding_tasks += 1;
        tokio::spawn(
            async move {
                let result =
                    instrument_driver_call("submit", iens, driver.submit(&realization)).await;
                let _ = tasks.send(TaskResult::Submitted { iens, result });
            }
            .instrument(realization_span(iens, attempt)),
        );
    }

    fn spawn_kill(&mut self, iens: Iens) {
        let driver = Arc::clone(&self.driver);
        let tasks = self.tasks_tx.clone();
        self.outstanding_tasks += 1;
        tokio::spawn(async move {
            let result = instrument_driver_call("kill", iens, driver.kill(iens)).await;
            let _ = tasks.send(TaskResult::Killed { iens, result });
        });
    }

    fn spawn_validation(&mut self, iens: Iens) {
        let Some(machine) = self.machines.get(&iens) else {
            return;
        };
        let realization = machine.realization().clone();
        let validator = Arc::clone(&self.validator);
        let tasks = self.tasks_tx.clone();
        self.outstanding_tasks += 1;
        tokio::spawn(async move {
            let result = validator.validate(&realization).await;
            let _ = tasks.send(TaskResult::Validated { iens, result });
        });
    }

    fn forward_transitions(&mut self) {
        while let Ok(transition) = self.transitions.try_recv() {
            if transition.to.is_terminal() {
                tracing::info!(
                    iens = %transition.iens,
                    state = %transition.to,
                    message = transition.message.as_deref().unwrap_or(""),
                    "realization finished"
                );
            }
            if let Some(updates) = &self.updates {
                let _ = updates.send(SchedulerUpdate::StateChange(transition));
            }
        }
    }

    fn publish_states(&self) {
        let histogram = self.count_states();
        self.states.send_if_modified(|current| {
            if current.counts == histogram.counts {
                false
            } else {
                *current = histogram;
                true
            }
        });
    }

    fn answer_kill_waiters(&mut self) {
        if self.kill_waiters.is_empty() {
            return;
        }
        let killing = self
            .machines
            .values()
            .any(|m| matches!(m.state(), RealizationState::DoKill | RealizationState::Waiting));
        if !killing {
            for ack in self.kill_waiters.drain(..) {
                let _ = ack.send(());
            }
        }
    }
}
