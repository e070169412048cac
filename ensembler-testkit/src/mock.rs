use async_trait::async_trait;
use ensembler::*;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

/// How [`MockDriver`] reacts to an accepted submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutoReport {
    /// Report nothing; the test drives every realization by hand.
    #[default]
    Manual,
    /// Report `pending` and `running`.
    Start,
    /// Report `pending`, `running` and `done`.
    Complete,
}

/// In-memory [`Driver`] that records calls and reports lifecycle events on
/// the channel returned by [`MockDriver::new`].
#[derive(Clone)]
pub struct MockDriver {
    events: mpsc::UnboundedSender<DriverEvent>,
    submissions: Arc<Mutex<Vec<Iens>>>,
    kills: Arc<Mutex<Vec<Iens>>>,
    auto: Arc<Mutex<AutoReport>>,
    failing_submits: Arc<Mutex<usize>>,
    failing_kills: Arc<Mutex<BTreeSet<Iens>>>,
    exit_on_submit: Arc<Mutex<HashMap<Iens, usize>>>,
}

impl MockDriver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let driver = Self {
            events,
            submissions: Arc::new(Mutex::new(Vec::new())),
            kills: Arc::new(Mutex::new(Vec::new())),
            auto: Arc::new(Mutex::new(AutoReport::Manual)),
            failing_submits: Arc::new(Mutex::new(0)),
            failing_kills: Arc::new(Mutex::new(BTreeSet::new())),
            exit_on_submit: Arc::new(Mutex::new(HashMap::new())),
        };
        (driver, rx)
    }

    pub fn with_auto(self, auto: AutoReport) -> Self {
        *self.auto.lock() = auto;
        self
    }

    pub fn set_auto(&self, auto: AutoReport) {
        *self.auto.lock() = auto;
    }

    /// Reject the next `count` submissions.
    pub fn fail_next_submits(&self, count: usize) {
        *self.failing_submits.lock() = count;
    }

    /// Report an `exit` for the next `count` attempts of `iens` instead of
    /// the configured auto report.
    pub fn exit_next_attempts(&self, iens: impl Into<Iens>, count: usize) {
        self.exit_on_submit.lock().insert(iens.into(), count);
    }

    /// Make every kill of `iens` fail.
    pub fn fail_kills_for(&self, iens: impl Into<Iens>) {
        self.failing_kills.lock().insert(iens.into());
    }

    pub fn report(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn start(&self, iens: impl Into<Iens>) {
        let iens = iens.into();
        self.report(DriverEvent::pending(iens));
        self.report(DriverEvent::running(iens));
    }

    pub fn complete(&self, iens: impl Into<Iens>) {
        self.report(DriverEvent::done(iens.into()));
    }

    pub fn fail(&self, iens: impl Into<Iens>, message: impl Into<String>) {
        self.report(DriverEvent::exit(iens.into(), Some(message.into())));
    }

    /// Every accepted or rejected submission, in call order.
    pub fn submitted(&self) -> Vec<Iens> {
        self.submissions.lock().clone()
    }

    pub fn submit_count(&self, iens: impl Into<Iens>) -> usize {
        let iens = iens.into();
        self.submissions.lock().iter().filter(|s| **s == iens).count()
    }

    pub fn killed(&self) -> Vec<Iens> {
        self.kills.lock().clone()
    }

    pub fn assert_submit_count_eq(&self, expected: usize) {
        let actual = self.submissions.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} submissions, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.submissions.lock().clear();
        self.kills.lock().clear();
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn submit(&self, realization: &Realization) -> anyhow::Result<()> {
        let iens = realization.iens;
        self.submissions.lock().push(iens);

        {
            let mut failing = self.failing_submits.lock();
            if *failing > 0 {
                *failing -= 1;
                anyhow::bail!("submission of realization {iens} rejected");
            }
        }

        let exits = {
            let mut exits = self.exit_on_submit.lock();
            match exits.get_mut(&iens) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if exits {
            self.start(iens);
            self.fail(iens, format!("realization {iens} exited with code 1"));
            return Ok(());
        }

        let auto = *self.auto.lock();
        match auto {
            AutoReport::Manual => {}
            AutoReport::Start => self.start(iens),
            AutoReport::Complete => {
                self.start(iens);
                self.complete(iens);
            }
        }
        Ok(())
    }

    async fn kill(&self, iens: Iens) -> anyhow::Result<()> {
        self.kills.lock().push(iens);
        if self.failing_kills.lock().contains(&iens) {
            anyhow::bail!("node hosting realization {iens} is unreachable");
        }
        Ok(())
    }
}

/// [`RunValidator`] rejecting a fixed set of realizations.
#[derive(Clone, Debug, Default)]
pub struct RejectingValidator {
    rejected: Arc<Mutex<BTreeSet<Iens>>>,
}

impl RejectingValidator {
    pub fn new(rejected: impl IntoIterator<Item = usize>) -> Self {
        Self {
            rejected: Arc::new(Mutex::new(rejected.into_iter().map(Iens).collect())),
        }
    }
}

#[async_trait]
impl RunValidator for RejectingValidator {
    async fn validate(&self, realization: &Realization) -> anyhow::Result<()> {
        if self.rejected.lock().contains(&realization.iens) {
            anyhow::bail!("expected output missing in {}", realization.run_path.display());
        }
        Ok(())
    }
}
