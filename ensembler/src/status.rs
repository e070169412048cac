use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::realization::{Iens, RealizationState, StepId};
use crate::snapshot::StepSnapshot;

/// Read-only status surface for reporting layers.
pub trait StatusExport {
    /// Latest known attributes of every step, keyed by realization and step.
    fn get_all_steps(&self) -> BTreeMap<(Iens, StepId), StepSnapshot>;

    /// Histogram of realization states at call time.
    fn count_states(&self) -> StateHistogram;
}

/// Realization state counts at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateHistogram {
    /// Timestamp when the histogram was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-state counts. States with no realizations are absent.
    pub counts: BTreeMap<RealizationState, usize>,
}

impl StateHistogram {
    /// Create an empty histogram at the given time.
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            counts: BTreeMap::new(),
        }
    }

    /// Build a histogram of the given states, sampled now.
    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = RealizationState>,
    {
        let mut histogram = Self::new(Utc::now());
        for state in states {
            histogram.record(state);
        }
        histogram
    }

    pub fn record(&mut self, state: RealizationState) {
        *self.counts.entry(state).or_default() += 1;
    }

    pub fn count(&self, state: RealizationState) -> usize {
        self.counts.get(&state).copied().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Realizations in a terminal state other than `SUCCESS`.
    pub fn lost(&self) -> usize {
        self.counts
            .iter()
            .filter(|(state, _)| state.is_lost())
            .map(|(_, count)| count)
            .sum()
    }

    /// True when the non-zero counts are exactly `expected`.
    pub fn matches(&self, expected: &[(RealizationState, usize)]) -> bool {
        let wanted: BTreeMap<_, _> = expected
            .iter()
            .filter(|(_, count)| *count > 0)
            .copied()
            .collect();
        let actual: BTreeMap<_, _> = self
            .counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(state, count)| (*state, *count))
            .collect();
        wanted == actual
    }
}

impl Default for StateHistogram {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl fmt::Display for StateHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (state, count) in &self.counts {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{state}: {count}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_counts_and_matches() {
        let histogram = StateHistogram::from_states([
            RealizationState::Running,
            RealizationState::Running,
            RealizationState::Waiting,
        ]);
        assert_eq!(histogram.count(RealizationState::Running), 2);
        assert_eq!(histogram.count(RealizationState::Success), 0);
        assert_eq!(histogram.total(), 3);
        assert!(histogram.matches(&[
            (RealizationState::Running, 2),
            (RealizationState::Waiting, 1),
            (RealizationState::Success, 0),
        ]));
        assert!(!histogram.matches(&[(RealizationState::Running, 2)]));
        assert_eq!(histogram.to_string(), "WAITING: 1, RUNNING: 2");
    }

    #[test]
    fn test_histogram_lost() {
        let histogram = StateHistogram::from_states([
            RealizationState::Failed,
            RealizationState::IsKilled,
            RealizationState::DoKillNodeFailure,
            RealizationState::Success,
        ]);
        assert_eq!(histogram.lost(), 3);
    }
}
