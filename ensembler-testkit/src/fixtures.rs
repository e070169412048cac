use chrono::Utc;
use ensembler::*;
use std::time::Duration;

/// `count` active realizations with run paths under `/tmp/ensembler-test`.
pub fn realizations(count: usize) -> Vec<Realization> {
    (0..count)
        .map(|i| Realization::new(i, format!("/tmp/ensembler-test/realization-{i}/iter-0")))
        .collect()
}

pub fn step_started(real: usize, step: usize, name: &str) -> Event {
    Event::StepStarted {
        real: Iens(real),
        step: StepId(step),
        name: name.to_string(),
        stdout: Some(format!("{name}.stdout.{step}").into()),
        stderr: Some(format!("{name}.stderr.{step}").into()),
        time: Utc::now(),
    }
}

pub fn step_running(real: usize, step: usize, memory: u64) -> Event {
    Event::StepRunning {
        real: Iens(real),
        step: StepId(step),
        current_memory_usage: Some(memory),
        max_memory_usage: Some(memory),
        cpu_seconds: None,
        time: Utc::now(),
    }
}

pub fn step_ended(real: usize, step: usize, exit_code: i32) -> Event {
    Event::StepEnded {
        real: Iens(real),
        step: StepId(step),
        exit_code,
        error: None,
        cpu_seconds: None,
        max_memory_usage: None,
        time: Utc::now(),
    }
}

/// Evaluator settings fast enough for tests.
pub fn fast_evaluator_config() -> EvaluatorConfig {
    EvaluatorConfig::new("test-ensemble", 0)
        .with_batching_interval(10)
        .with_heartbeat_interval(50)
        .with_heartbeat_timeout(2_000)
        .with_close_timeout(500)
}

/// Wait until the scheduler's histogram has exactly the `expected` non-zero counts.
pub async fn wait_for_states(
    handle: &SchedulerHandle,
    expected: &[(RealizationState, usize)],
    timeout: Duration,
) -> anyhow::Result<StateHistogram> {
    let mut changes = handle.state_changes();
    let waited = tokio::time::timeout(timeout, changes.wait_for(|h| h.matches(expected))).await;
    match waited {
        Ok(Ok(histogram)) => Ok(histogram.clone()),
        Ok(Err(_)) => anyhow::bail!("scheduler stopped before reaching {expected:?}"),
        Err(_) => anyhow::bail!(
            "timed out waiting for {expected:?}, last seen {}",
            handle.count_states()
        ),
    }
}
