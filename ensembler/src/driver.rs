use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::realization::{Iens, Realization};

/// Execution backend the scheduler hands realizations to.
///
/// Lifecycle notifications flow back through the [`DriverEvent`] channel the
/// scheduler was built with; the trait methods only report whether the
/// request itself was accepted.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Start (or restart) a realization in its run path.
    async fn submit(&self, realization: &Realization) -> anyhow::Result<()>;
    /// Terminate a submitted realization.
    async fn kill(&self, iens: Iens) -> anyhow::Result<()>;
}

/// What the backend observed about a submitted realization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverEventKind {
    /// Accepted and queued by the backend.
    Pending,
    /// Started executing.
    Running,
    /// Finished with exit code zero.
    Done,
    /// Finished unsuccessfully, or was rejected after submission.
    Exit { error: Option<String> },
}

/// Lifecycle notification from a [`Driver`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEvent {
    pub iens: Iens,
    #[serde(flatten)]
    pub kind: DriverEventKind,
}

impl DriverEvent {
    pub fn pending(iens: Iens) -> Self {
        Self {
            iens,
            kind: DriverEventKind::Pending,
        }
    }

    pub fn running(iens: Iens) -> Self {
        Self {
            iens,
            kind: DriverEventKind::Running,
        }
    }

    pub fn done(iens: Iens) -> Self {
        Self {
            iens,
            kind: DriverEventKind::Done,
        }
    }

    pub fn exit(iens: Iens, error: Option<String>) -> Self {
        Self {
            iens,
            kind: DriverEventKind::Exit { error },
        }
    }
}

/// Post-run check deciding whether a finished realization counts as a success.
///
/// Typically verifies that the expected output files exist.
#[async_trait]
pub trait RunValidator: Send + Sync {
    async fn validate(&self, realization: &Realization) -> anyhow::Result<()>;
}

/// Validator that accepts every finished realization.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl RunValidator for AcceptAll {
    async fn validate(&self, _realization: &Realization) -> anyhow::Result<()> {
        Ok(())
    }
}
