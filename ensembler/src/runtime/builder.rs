use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{EvaluatorConfig, SchedulerConfig};
use crate::driver::{Driver, DriverEvent, RunValidator};
use crate::realization::Realization;
use crate::scheduler::Scheduler;

use super::evaluator::{Evaluator, EvaluatorHandle};

/// Builder for an [`Evaluator`] and the [`Scheduler`] it drives.
///
/// # Example
///
/// ```ignore
/// use ensembler::*;
///
/// let (evaluator, handle) = EvaluatorBuilder::new(EvaluatorConfig::new("poly", 0))
///     .with_scheduler_config(SchedulerConfig::new(4))
///     .with_realizations(realizations)
///     .with_driver(driver, driver_events)
///     .build()?;
/// tokio::spawn(evaluator.run());
/// ```
pub struct EvaluatorBuilder<D: Driver + 'static> {
    config: EvaluatorConfig,
    scheduler_config: SchedulerConfig,
    realizations: Option<Vec<Realization>>,
    driver: Option<Arc<D>>,
    driver_events: Option<mpsc::UnboundedReceiver<DriverEvent>>,
    validator: Option<Arc<dyn RunValidator>>,
}

impl<D: Driver + 'static> fmt::Debug for EvaluatorBuilder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("EvaluatorBuilder");
        debug.field("config", &self.config);
        debug.field("scheduler_config", &self.scheduler_config);
        debug.field(
            "realizations",
            &self.realizations.as_ref().map(Vec::len),
        );
        debug.field("driver_set", &self.driver.is_some());
        debug.field("validator_set", &self.validator.is_some());
        if self.driver.is_some() {
            debug.field("driver_type", &type_name::<D>());
        }
        debug.finish()
    }
}

impl<D: Driver + 'static> EvaluatorBuilder<D> {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            config,
            scheduler_config: SchedulerConfig::default(),
            realizations: None,
            driver: None,
            driver_events: None,
            validator: None,
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn with_realizations(
        mut self,
        realizations: impl IntoIterator<Item = Realization>,
    ) -> Self {
        self.realizations = Some(realizations.into_iter().collect());
        self
    }

    /// Set the driver and the channel its lifecycle notifications arrive on.
    pub fn with_driver(
        mut self,
        driver: Arc<D>,
        driver_events: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> Self {
        self.driver = Some(driver);
        self.driver_events = Some(driver_events);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn RunValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// # Errors
    ///
    /// Returns an error if a required dependency is missing or the realization
    /// list is empty.
    pub fn build(self) -> anyhow::Result<(Evaluator<D>, EvaluatorHandle)> {
        let realizations = self
            .realizations
            .ok_or_else(|| anyhow::anyhow!("realizations missing"))?;
        if realizations.is_empty() {
            anyhow::bail!("an ensemble needs at least one realization");
        }
        let driver = self
            .driver
            .ok_or_else(|| anyhow::anyhow!("driver dependency missing"))?;
        let driver_events = self
            .driver_events
            .ok_or_else(|| anyhow::anyhow!("driver event stream missing"))?;

        let (mut scheduler, scheduler_handle) = Scheduler::new(
            self.scheduler_config,
            realizations.clone(),
            driver,
            driver_events,
        );
        if let Some(validator) = self.validator {
            scheduler = scheduler.with_validator(validator);
        }

        Ok(Evaluator::new(
            self.config,
            scheduler,
            scheduler_handle,
            realizations,
        ))
    }
}
