use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StateTransitionError;
use crate::realization::{Iens, Realization, RealizationState};

/// Record published when a realization enters an observable state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub iens: Iens,
    pub from: RealizationState,
    pub to: RealizationState,
    pub at: DateTime<Utc>,
    /// Set once the realization has been running.
    pub start_time: Option<DateTime<Utc>>,
    /// Failure or kill reason, when there is one.
    pub message: Option<String>,
}

/// Lifecycle of one realization for one iteration.
///
/// Each trigger method either performs its transition or, when fired from a
/// state that does not accept it, marks the realization `FAILED` (via
/// `UNKNOWN`) and returns a [`StateTransitionError`]. Terminal machines reject
/// every trigger without changing state.
///
/// Entering `PENDING`, `RUNNING`, `SUCCESS`, `FAILED` or `IS_KILLED` sends a
/// [`Transition`] on the outbound channel handed to [`RealizationStateMachine::new`].
#[derive(Debug)]
pub struct RealizationStateMachine {
    realization: Realization,
    state: RealizationState,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    retries_left: u32,
    message: Option<String>,
    outbound: mpsc::UnboundedSender<Transition>,
}

impl RealizationStateMachine {
    pub fn new(realization: Realization, outbound: mpsc::UnboundedSender<Transition>) -> Self {
        Self {
            retries_left: realization.max_retries,
            realization,
            state: RealizationState::Unknown,
            start_time: None,
            end_time: None,
            message: None,
            outbound,
        }
    }

    pub fn iens(&self) -> Iens {
        self.realization.iens
    }

    pub fn realization(&self) -> &Realization {
        &self.realization
    }

    pub fn state(&self) -> RealizationState {
        self.state
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// `UNKNOWN -> NOT_ACTIVE`
    pub fn allocate(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("allocate", &[RealizationState::Unknown], RealizationState::NotActive)
    }

    /// `NOT_ACTIVE -> WAITING`
    pub fn activate(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("activate", &[RealizationState::NotActive], RealizationState::Waiting)
    }

    /// `WAITING -> SUBMITTED`. The caller issues exactly one driver submission per call.
    pub fn submit(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("submit", &[RealizationState::Waiting], RealizationState::Submitted)
    }

    /// `SUBMITTED -> PENDING`
    pub fn accept(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("accept", &[RealizationState::Submitted], RealizationState::Pending)
    }

    /// `PENDING -> RUNNING`, recording the start time.
    pub fn start(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("start", &[RealizationState::Pending], RealizationState::Running)
    }

    /// `RUNNING -> DONE`
    pub fn runend(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("runend", &[RealizationState::Running], RealizationState::Done)
    }

    /// `PENDING | RUNNING -> EXIT`, then either resubmitted or `FAILED`.
    pub fn runfail(
        &mut self,
        message: Option<String>,
    ) -> Result<RealizationState, StateTransitionError> {
        self.fire(
            "runfail",
            &[RealizationState::Pending, RealizationState::Running],
            RealizationState::Exit,
        )?;
        Ok(self.handle_exit(message))
    }

    /// `SUBMITTED -> EXIT` when the driver rejects a submission.
    pub fn submitfail(
        &mut self,
        message: Option<String>,
    ) -> Result<RealizationState, StateTransitionError> {
        self.fire("submitfail", &[RealizationState::Submitted], RealizationState::Exit)?;
        Ok(self.handle_exit(message))
    }

    /// `DONE -> SUCCESS`
    pub fn validate(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("validate", &[RealizationState::Done], RealizationState::Success)
    }

    /// `DONE | EXIT -> FAILED`
    pub fn invalidate(
        &mut self,
        message: Option<String>,
    ) -> Result<RealizationState, StateTransitionError> {
        self.check("invalidate", &[RealizationState::Done, RealizationState::Exit])?;
        if message.is_some() {
            self.message = message;
        }
        self.enter(RealizationState::Failed);
        Ok(self.state)
    }

    /// `SUBMITTED | PENDING | RUNNING -> DO_KILL`
    pub fn dokill(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire(
            "dokill",
            &[
                RealizationState::Submitted,
                RealizationState::Pending,
                RealizationState::Running,
            ],
            RealizationState::DoKill,
        )
    }

    /// `WAITING -> IS_KILLED`, for realizations cancelled before submission.
    pub fn remove(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("remove", &[RealizationState::Waiting], RealizationState::IsKilled)
    }

    /// `DO_KILL -> IS_KILLED`
    pub fn verify_kill(&mut self) -> Result<RealizationState, StateTransitionError> {
        self.fire("verify_kill", &[RealizationState::DoKill], RealizationState::IsKilled)
    }

    /// `DO_KILL -> DO_KILL_NODE_FAILURE`
    pub fn ack_killfailure(
        &mut self,
        message: Option<String>,
    ) -> Result<RealizationState, StateTransitionError> {
        self.check("ack_killfailure", &[RealizationState::DoKill])?;
        if message.is_some() {
            self.message = message;
        }
        self.enter(RealizationState::DoKillNodeFailure);
        Ok(self.state)
    }

    /// Any non-terminal state `-> UNKNOWN -> FAILED`, isolating an
    /// unrecoverable inconsistency to this realization.
    pub fn something_went_wrong(
        &mut self,
        message: impl Into<String>,
    ) -> Result<RealizationState, StateTransitionError> {
        if self.state.is_terminal() {
            return Err(self.illegal("something_went_wrong"));
        }
        self.fail_isolated(message.into());
        Ok(self.state)
    }

    fn fire(
        &mut self,
        trigger: &'static str,
        from: &[RealizationState],
        to: RealizationState,
    ) -> Result<RealizationState, StateTransitionError> {
        self.check(trigger, from)?;
        self.enter(to);
        Ok(self.state)
    }

    fn check(
        &mut self,
        trigger: &'static str,
        from: &[RealizationState],
    ) -> Result<(), StateTransitionError> {
        if from.contains(&self.state) {
            return Ok(());
        }
        let err = self.illegal(trigger);
        if !self.state.is_terminal() {
            self.fail_isolated(err.to_string());
        }
        Err(err)
    }

    fn illegal(&self, trigger: &'static str) -> StateTransitionError {
        StateTransitionError {
            iens: self.iens(),
            trigger,
            from: self.state,
        }
    }

    fn fail_isolated(&mut self, message: String) {
        tracing::error!(iens = %self.iens(), state = %self.state, "{message}");
        self.message = Some(message);
        self.enter(RealizationState::Unknown);
        self.enter(RealizationState::Failed);
    }

    fn handle_exit(&mut self, message: Option<String>) -> RealizationState {
        if message.is_some() {
            self.message = message;
        }
        if self.retries_left > 0 {
            self.retries_left -= 1;
            tracing::info!(
                iens = %self.iens(),
                retries_left = self.retries_left,
                reason = self.message.as_deref().unwrap_or("unknown"),
                "resubmitting realization"
            );
            self.enter(RealizationState::Submitted);
        } else {
            self.enter(RealizationState::Failed);
        }
        self.state
    }

    fn enter(&mut self, to: RealizationState) {
        let from = self.state;
        let now = Utc::now();
        self.state = to;

        if to == RealizationState::Running {
            self.start_time = Some(now);
        }
        crate::telemetry::record_transition(self.iens(), from, to);
        if to.is_terminal() {
            self.end_time = Some(now);
            if let Some(start) = self.start_time {
                let elapsed = (now - start).to_std().unwrap_or_default();
                crate::telemetry::observe_realization_duration(to, elapsed);
            }
        }

        if to.is_observable() {
            let transition = Transition {
                iens: self.iens(),
                from,
                to,
                at: now,
                start_time: self.start_time,
                message: if to.is_lost() {
                    self.message.clone()
                } else {
                    None
                },
            };
            // A closed outbound channel means the scheduler is gone; the
            // machine itself stays consistent.
            let _ = self.outbound.send(transition);
        }
    }
}
