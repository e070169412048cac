//! Event-sourced ensemble status.
//!
//! A [`Snapshot`] is the canonical record of ensemble, realization and step
//! status. It only changes by merging [`PartialSnapshot`] deltas, which makes
//! it cheap to replicate: consumers receive one full snapshot and then replay
//! the same deltas the owner merged.
//!
//! Merging is idempotent, last-writer-wins per leaf attribute, and creates
//! realizations or steps it has not seen before. Once the ensemble status is
//! terminal the snapshot is frozen and every further merge is rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::events::Event;
use crate::realization::{Iens, Realization, RealizationState, StepId};
use crate::state_machine::Transition;
use crate::status::{StateHistogram, StatusExport};

/// Error message given to steps that were still going when their realization
/// exceeded its maximum runtime.
pub const MAX_RUNTIME_MESSAGE: &str = "The run is cancelled due to reaching MAX_RUNTIME";

/// Ensemble-level status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleStatus {
    #[default]
    Unknown,
    Started,
    Stopped,
    Cancelled,
    Failed,
}

impl EnsembleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnsembleStatus::Stopped | EnsembleStatus::Cancelled | EnsembleStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            EnsembleStatus::Unknown => 0,
            EnsembleStatus::Started => 1,
            EnsembleStatus::Stopped | EnsembleStatus::Cancelled | EnsembleStatus::Failed => 2,
        }
    }

    /// Apply the precedence table: terminal statuses are sticky and the first
    /// terminal status wins; otherwise a status never moves to a lower rank.
    pub fn advance(self, next: EnsembleStatus) -> EnsembleStatus {
        if self.is_terminal() || next.rank() < self.rank() {
            self
        } else {
            next
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnsembleStatus::Unknown => "unknown",
            EnsembleStatus::Started => "started",
            EnsembleStatus::Stopped => "stopped",
            EnsembleStatus::Cancelled => "cancelled",
            EnsembleStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EnsembleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one forward-model step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Finished | StepStatus::Failed)
    }
}

fn overwrite<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if src.is_some() {
        dst.clone_from(src);
    }
}

/// Latest known attributes of one step. Absent leaves are unknown in a
/// snapshot and untouched in a delta.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory_usage: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl StepSnapshot {
    pub fn update(&mut self, other: &StepSnapshot) {
        overwrite(&mut self.status, &other.status);
        overwrite(&mut self.name, &other.name);
        overwrite(&mut self.start_time, &other.start_time);
        overwrite(&mut self.end_time, &other.end_time);
        overwrite(&mut self.cpu_seconds, &other.cpu_seconds);
        overwrite(&mut self.current_memory_usage, &other.current_memory_usage);
        overwrite(&mut self.max_memory_usage, &other.max_memory_usage);
        overwrite(&mut self.stdout, &other.stdout);
        overwrite(&mut self.stderr, &other.stderr);
        overwrite(&mut self.error, &other.error);
        overwrite(&mut self.exit_code, &other.exit_code);
        overwrite(&mut self.checksum, &other.checksum);
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some_and(|status| status.is_terminal())
    }

    /// Wall-clock duration, when both ends are known.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.start_time?, self.end_time?);
        (end - start).to_std().ok()
    }
}

/// Latest known attributes of one realization and its steps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealizationSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RealizationState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<StepId, StepSnapshot>,
}

impl RealizationSnapshot {
    pub fn update(&mut self, other: &RealizationSnapshot) {
        overwrite(&mut self.status, &other.status);
        overwrite(&mut self.active, &other.active);
        overwrite(&mut self.start_time, &other.start_time);
        overwrite(&mut self.end_time, &other.end_time);
        overwrite(&mut self.message, &other.message);
        for (step_id, step) in &other.steps {
            self.steps.entry(*step_id).or_default().update(step);
        }
    }

    fn is_finished(&self) -> bool {
        self.status.is_some_and(|status| status.is_terminal())
    }
}

fn merge_reals(
    dst: &mut BTreeMap<Iens, RealizationSnapshot>,
    src: &BTreeMap<Iens, RealizationSnapshot>,
) {
    for (iens, real) in src {
        dst.entry(*iens).or_default().update(real);
    }
}

/// Result of merging a delta into a [`Snapshot`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeOutcome {
    Applied,
    /// The snapshot was already terminal; nothing changed.
    RejectedTerminal,
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Applied => "applied",
            MergeOutcome::RejectedTerminal => "rejected_terminal",
        }
    }
}

/// Canonical ensemble status for one iteration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    status: EnsembleStatus,
    reals: BTreeMap<Iens, RealizationSnapshot>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial snapshot listing every realization with its active flag.
    pub fn from_realizations<'a, I>(realizations: I) -> Self
    where
        I: IntoIterator<Item = &'a Realization>,
    {
        let reals = realizations
            .into_iter()
            .map(|real| {
                let status = if real.active {
                    RealizationState::Waiting
                } else {
                    RealizationState::NotActive
                };
                let snapshot = RealizationSnapshot {
                    status: Some(status),
                    active: Some(real.active),
                    ..RealizationSnapshot::default()
                };
                (real.iens, snapshot)
            })
            .collect();
        Self {
            status: EnsembleStatus::Unknown,
            reals,
        }
    }

    pub fn status(&self) -> EnsembleStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn reals(&self) -> &BTreeMap<Iens, RealizationSnapshot> {
        &self.reals
    }

    pub fn get_real(&self, iens: Iens) -> Option<&RealizationSnapshot> {
        self.reals.get(&iens)
    }

    pub fn get_step(&self, iens: Iens, step: StepId) -> Option<&StepSnapshot> {
        self.reals.get(&iens)?.steps.get(&step)
    }

    /// Merge a delta. Rejected without any change once the ensemble is terminal.
    pub fn merge(&mut self, partial: &PartialSnapshot) -> MergeOutcome {
        if self.status.is_terminal() {
            return MergeOutcome::RejectedTerminal;
        }
        merge_reals(&mut self.reals, &partial.reals);
        if let Some(status) = partial.status {
            self.status = self.status.advance(status);
        }
        MergeOutcome::Applied
    }

    /// Realizations whose state is `SUCCESS`.
    pub fn successful_realizations(&self) -> Vec<Iens> {
        self.reals
            .iter()
            .filter(|(_, real)| real.status == Some(RealizationState::Success))
            .map(|(iens, _)| *iens)
            .collect()
    }

    /// Number of realizations in each state.
    pub fn aggregate_real_states(&self) -> BTreeMap<RealizationState, usize> {
        let mut counts = BTreeMap::new();
        for state in self.reals.values().filter_map(|real| real.status) {
            *counts.entry(state).or_default() += 1;
        }
        counts
    }

    /// Steps reported for one realization, in step order.
    pub fn steps_for_realization(
        &self,
        iens: Iens,
    ) -> impl Iterator<Item = (StepId, &StepSnapshot)> {
        self.reals
            .get(&iens)
            .into_iter()
            .flat_map(|real| real.steps.iter().map(|(id, step)| (*id, step)))
    }

    /// Steps of `iens` that have not reached `Finished` or `Failed`.
    pub fn unfinished_steps(&self, iens: Iens) -> Vec<StepId> {
        self.reals
            .get(&iens)
            .map(|real| {
                real.steps
                    .iter()
                    .filter(|(_, step)| !step.is_finished())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The step with the largest reported peak memory.
    pub fn max_memory_usage(&self) -> Option<(Iens, StepId, u64)> {
        self.reals
            .iter()
            .flat_map(|(iens, real)| {
                real.steps
                    .iter()
                    .filter_map(move |(id, step)| Some((*iens, *id, step.max_memory_usage?)))
            })
            .max_by_key(|(_, _, bytes)| *bytes)
    }
}

impl StatusExport for Snapshot {
    fn get_all_steps(&self) -> BTreeMap<(Iens, StepId), StepSnapshot> {
        self.reals
            .iter()
            .flat_map(|(iens, real)| {
                real.steps
                    .iter()
                    .map(move |(id, step)| ((*iens, *id), step.clone()))
            })
            .collect()
    }

    fn count_states(&self) -> StateHistogram {
        let mut histogram = StateHistogram::new(Utc::now());
        histogram.counts = self.aggregate_real_states();
        histogram
    }
}

/// Sparse delta over the [`Snapshot`] key space.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<EnsembleStatus>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    reals: BTreeMap<Iens, RealizationSnapshot>,
}

impl PartialSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: EnsembleStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status(&self) -> Option<EnsembleStatus> {
        self.status
    }

    pub fn reals(&self) -> &BTreeMap<Iens, RealizationSnapshot> {
        &self.reals
    }

    pub fn get_real(&self, iens: Iens) -> Option<&RealizationSnapshot> {
        self.reals.get(&iens)
    }

    pub fn get_step(&self, iens: Iens, step: StepId) -> Option<&StepSnapshot> {
        self.reals.get(&iens)?.steps.get(&step)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.reals.is_empty()
    }

    pub fn update_realization(&mut self, iens: Iens, real: &RealizationSnapshot) -> &mut Self {
        self.reals.entry(iens).or_default().update(real);
        self
    }

    pub fn update_step(&mut self, iens: Iens, step: StepId, update: &StepSnapshot) -> &mut Self {
        self.reals
            .entry(iens)
            .or_default()
            .steps
            .entry(step)
            .or_default()
            .update(update);
        self
    }

    /// Fold a later delta into this one, as if both had been merged in order.
    pub fn merge(&mut self, later: &PartialSnapshot) {
        merge_reals(&mut self.reals, &later.reals);
        self.status = match (self.status, later.status) {
            (Some(current), Some(next)) => Some(current.advance(next)),
            (current, next) => next.or(current),
        };
    }

    /// Delta for a worker step event. `None` for events that carry no step data.
    pub fn from_step_event(event: &Event) -> Option<PartialSnapshot> {
        let (real, step, update) = match event {
            Event::StepStarted {
                real,
                step,
                name,
                stdout,
                stderr,
                time,
            } => (
                *real,
                *step,
                StepSnapshot {
                    status: Some(StepStatus::Pending),
                    name: Some(name.clone()),
                    start_time: Some(*time),
                    stdout: stdout.clone(),
                    stderr: stderr.clone(),
                    ..StepSnapshot::default()
                },
            ),
            Event::StepRunning {
                real,
                step,
                current_memory_usage,
                max_memory_usage,
                cpu_seconds,
                ..
            } => (
                *real,
                *step,
                StepSnapshot {
                    status: Some(StepStatus::Running),
                    current_memory_usage: *current_memory_usage,
                    max_memory_usage: *max_memory_usage,
                    cpu_seconds: *cpu_seconds,
                    ..StepSnapshot::default()
                },
            ),
            Event::StepEnded {
                real,
                step,
                exit_code,
                error,
                cpu_seconds,
                max_memory_usage,
                time,
            } => {
                let failed = *exit_code != 0 || error.is_some();
                let error = match (failed, error) {
                    (_, Some(error)) => Some(error.clone()),
                    (true, None) => Some(format!("exited with code {exit_code}")),
                    (false, None) => None,
                };
                (
                    *real,
                    *step,
                    StepSnapshot {
                        status: Some(if failed {
                            StepStatus::Failed
                        } else {
                            StepStatus::Finished
                        }),
                        end_time: Some(*time),
                        exit_code: Some(*exit_code),
                        error,
                        cpu_seconds: *cpu_seconds,
                        max_memory_usage: *max_memory_usage,
                        ..StepSnapshot::default()
                    },
                )
            }
            Event::StepChecksum {
                real,
                step,
                checksum,
                ..
            } => (
                *real,
                *step,
                StepSnapshot {
                    checksum: Some(checksum.clone()),
                    ..StepSnapshot::default()
                },
            ),
            Event::FullSnapshot { .. }
            | Event::SnapshotUpdate { .. }
            | Event::Terminated { .. }
            | Event::Done { .. }
            | Event::UserCancel
            | Event::UserDone => return None,
        };

        let mut partial = PartialSnapshot::new();
        partial.update_step(real, step, &update);
        Some(partial)
    }

    /// Delta for a published realization state change.
    pub fn from_state_change(transition: &Transition) -> PartialSnapshot {
        let real = RealizationSnapshot {
            status: Some(transition.to),
            start_time: transition.start_time,
            end_time: transition.to.is_terminal().then_some(transition.at),
            message: transition.message.clone(),
            ..RealizationSnapshot::default()
        };
        let mut partial = PartialSnapshot::new();
        partial.update_realization(transition.iens, &real);
        partial
    }

    /// Fail every unfinished step of a realization that ran out of time.
    pub fn realization_timeout(
        iens: Iens,
        snapshot: &Snapshot,
        at: DateTime<Utc>,
    ) -> PartialSnapshot {
        let mut partial = PartialSnapshot::new();
        let timed_out = StepSnapshot {
            status: Some(StepStatus::Failed),
            end_time: Some(at),
            error: Some(MAX_RUNTIME_MESSAGE.to_string()),
            ..StepSnapshot::default()
        };
        for step in snapshot.unfinished_steps(iens) {
            partial.update_step(iens, step, &timed_out);
        }
        let message = RealizationSnapshot {
            message: Some(MAX_RUNTIME_MESSAGE.to_string()),
            ..RealizationSnapshot::default()
        };
        partial.update_realization(iens, &message);
        partial
    }

    /// Synthetic failure for a realization whose reporting worker went silent:
    /// its unfinished steps fail and the realization carries the reason, even
    /// when every step it reported had already ended. Realizations already
    /// terminal are left alone.
    pub fn lost_worker(
        iens: Iens,
        identity: &str,
        snapshot: &Snapshot,
        at: DateTime<Utc>,
    ) -> Option<PartialSnapshot> {
        if snapshot.get_real(iens).is_some_and(RealizationSnapshot::is_finished) {
            return None;
        }
        let reason = format!("lost heartbeat from worker `{identity}`");
        let failed = StepSnapshot {
            status: Some(StepStatus::Failed),
            end_time: Some(at),
            error: Some(reason.clone()),
            ..StepSnapshot::default()
        };
        let mut partial = PartialSnapshot::new();
        for step in snapshot.unfinished_steps(iens) {
            partial.update_step(iens, step, &failed);
        }
        partial.update_realization(
            iens,
            &RealizationSnapshot {
                message: Some(reason),
                ..RealizationSnapshot::default()
            },
        );
        Some(partial)
    }
}
