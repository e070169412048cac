use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;

/// Ensemble-unique realization index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct Iens(pub usize);

impl Display for Iens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for Iens {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Index of a forward-model step inside one realization.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct StepId(pub usize);

impl Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for StepId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

// Indices are JSON map keys inside internally tagged events, where serde
// buffers them as strings, so both spellings are accepted.
struct IndexVisitor;

impl Visitor<'_> for IndexVisitor {
    type Value = usize;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or its decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<usize, E> {
        usize::try_from(v).map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<usize, E> {
        usize::try_from(v).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<usize, E> {
        v.parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Iens {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IndexVisitor).map(Self)
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IndexVisitor).map(Self)
    }
}

/// One independent unit of ensemble work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Realization {
    /// Ensemble-unique index.
    pub iens: Iens,
    /// Inactive realizations are allocated but never submitted.
    pub active: bool,
    /// Number of CPUs the backend reserves for this realization.
    pub num_cpu: u32,
    /// Wall-clock limit measured from the moment the realization starts running.
    #[serde(default)]
    pub max_runtime: Option<Duration>,
    /// Working directory handed to the driver.
    pub run_path: PathBuf,
    /// How many times a failed attempt is resubmitted before giving up.
    pub max_retries: u32,
}

impl Realization {
    pub const DEFAULT_MAX_RETRIES: u32 = 1;

    /// Create an active single-CPU realization with the default retry budget.
    pub fn new(iens: impl Into<Iens>, run_path: impl Into<PathBuf>) -> Self {
        Self {
            iens: iens.into(),
            active: true,
            num_cpu: 1,
            max_runtime: None,
            run_path: run_path.into(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_num_cpu(mut self, num_cpu: u32) -> Self {
        self.num_cpu = num_cpu.max(1);
        self
    }

    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Lifecycle state of a single realization.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealizationState {
    Unknown,
    NotActive,
    Waiting,
    Submitted,
    Pending,
    Running,
    Done,
    Exit,
    DoKill,
    IsKilled,
    Success,
    Failed,
    DoKillNodeFailure,
}

impl RealizationState {
    pub const ALL: [RealizationState; 13] = [
        RealizationState::Unknown,
        RealizationState::NotActive,
        RealizationState::Waiting,
        RealizationState::Submitted,
        RealizationState::Pending,
        RealizationState::Running,
        RealizationState::Done,
        RealizationState::Exit,
        RealizationState::DoKill,
        RealizationState::IsKilled,
        RealizationState::Success,
        RealizationState::Failed,
        RealizationState::DoKillNodeFailure,
    ];

    /// No transition is accepted out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RealizationState::Success
                | RealizationState::Failed
                | RealizationState::IsKilled
                | RealizationState::DoKillNodeFailure
        )
    }

    /// States that occupy one of the scheduler's `max_running` slots.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            RealizationState::Submitted
                | RealizationState::Pending
                | RealizationState::Running
                | RealizationState::DoKill
        )
    }

    /// Entering one of these states publishes a transition record.
    pub fn is_observable(&self) -> bool {
        matches!(
            self,
            RealizationState::Pending
                | RealizationState::Running
                | RealizationState::Success
                | RealizationState::Failed
                | RealizationState::IsKilled
        )
    }

    /// Terminal states other than `Success`: the realization can no longer succeed.
    pub fn is_lost(&self) -> bool {
        self.is_terminal() && *self != RealizationState::Success
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RealizationState::Unknown => "UNKNOWN",
            RealizationState::NotActive => "NOT_ACTIVE",
            RealizationState::Waiting => "WAITING",
            RealizationState::Submitted => "SUBMITTED",
            RealizationState::Pending => "PENDING",
            RealizationState::Running => "RUNNING",
            RealizationState::Done => "DONE",
            RealizationState::Exit => "EXIT",
            RealizationState::DoKill => "DO_KILL",
            RealizationState::IsKilled => "IS_KILLED",
            RealizationState::Success => "SUCCESS",
            RealizationState::Failed => "FAILED",
            RealizationState::DoKillNodeFailure => "DO_KILL_NODE_FAILURE",
        }
    }
}

impl Display for RealizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed ratio of consumed CPU seconds to `wall clock * num_cpu`.
pub const CPU_OVERSPEND_TOLERANCE: f64 = 1.05;

/// Describe a step that used noticeably more CPU than its realization reserved.
///
/// Returns `None` when the step stayed within [`CPU_OVERSPEND_TOLERANCE`] or
/// when its duration is zero.
pub fn detect_overspent_cpu(
    num_cpu: u32,
    iens: Iens,
    step_name: &str,
    cpu_seconds: f64,
    duration: Duration,
) -> Option<String> {
    let wall = duration.as_secs_f64();
    if wall <= 0.0 {
        return None;
    }
    let factor = cpu_seconds / wall;
    if factor > f64::from(num_cpu) * CPU_OVERSPEND_TOLERANCE {
        Some(format!(
            "Misconfigured NUM_CPU, forward model step '{step_name}' for realization {iens} \
             spent {cpu_seconds} cpu seconds with wall clock duration {wall:.1} seconds, \
             a factor of {factor:.2}, while NUM_CPU was {num_cpu}."
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = RealizationState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .copied()
            .collect();
        assert_eq!(
            terminal,
            vec![
                RealizationState::IsKilled,
                RealizationState::Success,
                RealizationState::Failed,
                RealizationState::DoKillNodeFailure,
            ]
        );
        assert!(!RealizationState::Success.is_lost());
        assert!(RealizationState::DoKillNodeFailure.is_lost());
    }

    #[test]
    fn test_state_serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&RealizationState::DoKillNodeFailure).unwrap();
        assert_eq!(json, "\"DO_KILL_NODE_FAILURE\"");
        assert_eq!(RealizationState::NotActive.to_string(), "NOT_ACTIVE");
    }

    #[test]
    fn test_realization_builder_defaults() {
        let real = Realization::new(3, "/tmp/run/realization-3")
            .with_num_cpu(0)
            .with_max_runtime(Duration::from_secs(60));
        assert_eq!(real.iens, Iens(3));
        assert!(real.active);
        assert_eq!(real.num_cpu, 1);
        assert_eq!(real.max_retries, Realization::DEFAULT_MAX_RETRIES);
        assert_eq!(real.max_runtime, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_detect_overspent_cpu() {
        let message =
            detect_overspent_cpu(1, Iens(0), "poly_eval", 21.0, Duration::from_secs(10)).unwrap();
        assert!(message.contains("Misconfigured NUM_CPU"));
        assert!(message.contains("a factor of 2.10"));

        assert!(
            detect_overspent_cpu(2, Iens(0), "poly_eval", 20.0, Duration::from_secs(10)).is_none()
        );
        assert!(detect_overspent_cpu(1, Iens(0), "poly_eval", 1.0, Duration::ZERO).is_none());
    }

    #[test]
    fn test_iens_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Iens(7), "seven");
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"7":"seven"}"#);
        let back: std::collections::BTreeMap<Iens, String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&Iens(7)).map(String::as_str), Some("seven"));
    }
}
