//! Polynomial case run locally.
//!
//! Every realization is a tokio task that plays both roles a real compute
//! backend splits up: the driver reporting lifecycle events to the scheduler,
//! and the worker inside the realization reporting step events to the
//! evaluator. A monitor prints progress as it arrives.
//!
//! Run with `RUST_LOG=ensembler=debug` to see the evaluator's own logs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ensembler::*;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

const ENSEMBLE_SIZE: usize = 8;
const STEPS: [&str; 2] = ["poly_eval", "poly_post"];

/// Runs realizations as local tasks.
struct LocalDriver {
    events: mpsc::UnboundedSender<DriverEvent>,
    evaluator: OnceLock<EvaluatorHandle>,
    running: Mutex<HashMap<Iens, AbortHandle>>,
    attempts: Mutex<HashMap<Iens, u32>>,
}

impl LocalDriver {
    fn new() -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let driver = Self {
            events,
            evaluator: OnceLock::new(),
            running: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        };
        (driver, rx)
    }
}

#[async_trait]
impl Driver for LocalDriver {
    async fn submit(&self, realization: &Realization) -> anyhow::Result<()> {
        let handle = self
            .evaluator
            .get()
            .ok_or_else(|| anyhow::anyhow!("driver used before the evaluator was built"))?
            .clone();
        let iens = realization.iens;
        let attempt = {
            let mut attempts = self.attempts.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            let attempt = attempts.entry(iens).or_default();
            *attempt += 1;
            *attempt
        };
        // Realization 3 crashes on its first attempt to show a resubmission.
        let crash = iens == Iens(3) && attempt == 1;

        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let _ = events.send(DriverEvent::pending(iens));
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = events.send(DriverEvent::running(iens));

            let outcome = run_forward_model(&handle, iens, attempt, crash).await;
            let _ = match outcome {
                Ok(()) => events.send(DriverEvent::done(iens)),
                Err(err) => events.send(DriverEvent::exit(iens, Some(format!("{err:#}")))),
            };
        });
        self.running
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .insert(iens, task.abort_handle());
        Ok(())
    }

    async fn kill(&self, iens: Iens) -> anyhow::Result<()> {
        if let Some(task) = self
            .running
            .lock()
            .map_err(|_| anyhow::anyhow!("poisoned"))?
            .remove(&iens)
        {
            task.abort();
        }
        Ok(())
    }
}

/// The worker side of one realization: evaluate y = a*x^2 + b*x + c, step by step.
async fn run_forward_model(
    handle: &EvaluatorHandle,
    iens: Iens,
    attempt: u32,
    crash: bool,
) -> anyhow::Result<()> {
    let mut link = handle.attach(format!("worker-{iens}-{attempt}"));
    link.connect(PeerRole::Worker)?;

    for (index, name) in STEPS.iter().enumerate() {
        let step = StepId(index);
        link.send_event(Event::StepStarted {
            real: iens,
            step,
            name: name.to_string(),
            stdout: Some(format!("{name}.stdout.{index}").into()),
            stderr: Some(format!("{name}.stderr.{index}").into()),
            time: Utc::now(),
        })?;
        let started = Utc::now();
        tokio::time::sleep(Duration::from_millis(80 + 20 * iens.0 as u64)).await;
        link.send_event(Event::StepRunning {
            real: iens,
            step,
            current_memory_usage: Some(64 << 20),
            max_memory_usage: Some((64 + iens.0 as u64) << 20),
            cpu_seconds: None,
            time: Utc::now(),
        })?;
        link.heartbeat()?;

        let exit_code = if crash && index == 0 { 1 } else { 0 };
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        link.send_event(Event::StepEnded {
            real: iens,
            step,
            exit_code,
            error: None,
            cpu_seconds: Some(elapsed.as_secs_f64()),
            max_memory_usage: Some((64 + iens.0 as u64) << 20),
            time: Utc::now(),
        })?;
        if exit_code != 0 {
            link.disconnect()?;
            anyhow::bail!("{name} exited with code {exit_code}");
        }
    }
    link.disconnect()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("=== Ensembler Poly Case ===\n");

    let (driver, driver_events) = LocalDriver::new();
    let driver = Arc::new(driver);
    let realizations = (0..ENSEMBLE_SIZE)
        .map(|i| {
            Realization::new(i, format!("poly_out/realization-{i}/iter-0")).with_max_retries(1)
        });

    let config = EvaluatorConfig::new("poly_case", 0)
        .with_batching_interval(100)
        .with_heartbeat_interval(250);
    let (evaluator, handle) = EvaluatorBuilder::new(config)
        .with_scheduler_config(SchedulerConfig::new(4))
        .with_realizations(realizations)
        .with_driver(Arc::clone(&driver), driver_events)
        .build()?;
    if driver.evaluator.set(handle.clone()).is_err() {
        anyhow::bail!("evaluator handle already set");
    }

    let mut monitor = Monitor::connect(handle.attach("poly-monitor"))?;
    let run = tokio::spawn(evaluator.run());

    while let Some(event) = monitor.next_event().await? {
        match &event {
            Event::SnapshotUpdate { delta, .. } => {
                for (iens, real) in delta.reals() {
                    if let Some(status) = real.status {
                        println!("realization {iens} -> {status}");
                    }
                }
            }
            Event::Done { status, .. } => println!("\nensemble {status}"),
            Event::Terminated { failure, .. } => {
                if let Some(failure) = failure {
                    println!("failure: {failure}");
                }
                break;
            }
            _ => {}
        }
    }
    monitor.signal_done()?;

    let outcome = run.await??;
    println!("\nFinal state counts: {}", outcome.histogram);
    let peak = monitor
        .replica()
        .get(0)
        .and_then(|snapshot| snapshot.max_memory_usage());
    if let Some((iens, step, bytes)) = peak {
        println!(
            "Peak memory: {} MiB (realization {iens}, step {step})",
            bytes >> 20
        );
    }
    Ok(())
}
