use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::alert::{Alert, AlertDispatcher, AlertTransition};
use crate::config::ContinuousSection;
use crate::error::TesterError;
use crate::metrics::TesterMetrics;
use crate::session::RunOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Ok,
    Failing,
}

/// Two-state health machine; a transition is reported only when the state
/// flips, so a contiguous failing run alerts once.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    consecutive_failures: u32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self {
            state: HealthState::Ok,
            consecutive_failures: 0,
        }
    }
}

impl HealthTracker {
    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn observe(&mut self, success: bool) -> Option<AlertTransition> {
        if success {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        match (self.state, success) {
            (HealthState::Ok, false) => {
                self.state = HealthState::Failing;
                Some(AlertTransition::Failing)
            }
            (HealthState::Failing, true) => {
                self.state = HealthState::Ok;
                Some(AlertTransition::Recovered)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub cycle: u64,
    pub exit_code: i32,
    pub error: Option<TesterError>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub tester: String,
    pub state: HealthState,
    pub cycles: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last: Option<CycleResult>,
}

#[derive(Debug)]
struct RunnerState {
    health: HealthTracker,
    history: VecDeque<CycleResult>,
    cycles: u64,
    failures: u64,
}

/// Loops test cycles until the total duration passes or the lifetime is
/// cancelled. Cycle failures never stop the loop; they drive alerting.
pub struct ContinuousRunner {
    tester: String,
    total_duration: Duration,
    pause: Duration,
    cycle_timeout: Option<Duration>,
    history_capacity: usize,
    dispatcher: AlertDispatcher,
    metrics: Option<TesterMetrics>,
    state: Mutex<RunnerState>,
}

impl std::fmt::Debug for ContinuousRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousRunner")
            .field("tester", &self.tester)
            .field("total_duration", &self.total_duration)
            .field("pause", &self.pause)
            .field("cycle_timeout", &self.cycle_timeout)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl ContinuousRunner {
    pub fn new(
        tester: impl Into<String>,
        total_duration: Duration,
        pause: Duration,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            tester: tester.into(),
            total_duration,
            pause,
            cycle_timeout: None,
            history_capacity: 100,
            dispatcher,
            metrics: None,
            state: Mutex::new(RunnerState {
                health: HealthTracker::default(),
                history: VecDeque::new(),
                cycles: 0,
                failures: 0,
            }),
        }
    }

    /// Runner with duration, pause, cycle timeout and history size from
    /// `section`. A missing total duration runs until cancelled.
    pub fn from_config(
        tester: impl Into<String>,
        section: &ContinuousSection,
        dispatcher: AlertDispatcher,
    ) -> Self {
        let mut runner = Self::new(
            tester,
            section.total_duration().unwrap_or(Duration::MAX),
            section.pause(),
            dispatcher,
        )
        .with_history_capacity(section.history_capacity);
        runner.cycle_timeout = section.cycle_timeout();
        runner
    }

    pub fn with_cycle_timeout(mut self, cycle_timeout: Option<Duration>) -> Self {
        self.cycle_timeout = cycle_timeout;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: TesterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn state(&self) -> MutexGuard<'_, RunnerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn status(&self) -> RunnerStatus {
        let state = self.state();
        RunnerStatus {
            tester: self.tester.clone(),
            state: state.health.state(),
            cycles: state.cycles,
            failures: state.failures,
            consecutive_failures: state.health.consecutive_failures(),
            last: state.history.back().cloned(),
        }
    }

    pub fn history(&self) -> Vec<CycleResult> {
        self.state().history.iter().cloned().collect()
    }

    /// Runs cycles built by `build_cycle`, which receives the cycle number and
    /// the cycle's own lifetime. Ends cleanly on cancellation or once the
    /// total duration has elapsed.
    pub async fn run<F, Fut>(&self, mut build_cycle: F, cancel: &CancellationToken) -> RunOutcome
    where
        F: FnMut(u64, CancellationToken) -> Fut,
        Fut: Future<Output = RunOutcome>,
    {
        let started = Instant::now();
        let mut cycle = 0u64;
        while !cancel.is_cancelled() && started.elapsed() < self.total_duration {
            cycle += 1;
            let cycle_cancel = cancel.child_token();
            let cycle_started_at = Utc::now();
            let cycle_start = Instant::now();
            info!(tester = %self.tester, cycle, "cycle started");

            let work = build_cycle(cycle, cycle_cancel.clone());
            tokio::pin!(work);
            let outcome = match self.cycle_timeout {
                None => work.await,
                Some(limit) => match timeout(limit, &mut work).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(tester = %self.tester, cycle, "cycle timed out, cancelling");
                        cycle_cancel.cancel();
                        let outcome = work.await;
                        if outcome.error.is_some() {
                            outcome
                        } else {
                            RunOutcome::from_result(Err(TesterError::deadline_exceeded(format!(
                                "cycle exceeded {}s",
                                limit.as_secs()
                            ))))
                        }
                    }
                },
            };
            cycle_cancel.cancel();

            if cancel.is_cancelled() {
                info!(tester = %self.tester, cycle, "cycle interrupted by shutdown");
                break;
            }
            self.record(cycle, cycle_started_at, cycle_start.elapsed(), outcome)
                .await;

            let elapsed = started.elapsed();
            if elapsed >= self.total_duration {
                break;
            }
            if !self.pause.is_zero() {
                let wait = self.pause.min(self.total_duration - elapsed);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(wait) => {}
                }
            }
        }
        let status = self.status();
        info!(
            tester = %self.tester,
            cycles = status.cycles,
            failures = status.failures,
            "continuous run finished"
        );
        RunOutcome::success()
    }

    async fn record(
        &self,
        cycle: u64,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        outcome: RunOutcome,
    ) {
        let result = CycleResult {
            cycle,
            exit_code: outcome.exit_code,
            error: outcome.error,
            duration_ms: elapsed.as_millis() as u64,
            started_at,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_cycle(
                &self.tester,
                elapsed,
                result.error.as_ref().map(|err| err.kind),
            );
        }
        match &result.error {
            Some(err) => warn!(tester = %self.tester, cycle, error = %err, "cycle failed"),
            None => info!(tester = %self.tester, cycle, elapsed_ms = result.duration_ms, "cycle succeeded"),
        }

        let transition = {
            let mut state = self.state();
            state.cycles += 1;
            if !result.is_success() {
                state.failures += 1;
            }
            let transition = state.health.observe(result.is_success());
            state.history.push_back(result.clone());
            while state.history.len() > self.history_capacity {
                state.history.pop_front();
            }
            transition
        };

        if let Some(transition) = transition {
            let alert = Alert {
                tester: self.tester.clone(),
                transition,
                phase: result
                    .error
                    .as_ref()
                    .and_then(|err| err.phase().map(str::to_string)),
                error_kind: result.error.as_ref().map(|err| err.kind),
                detail: result
                    .error
                    .as_ref()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| format!("cycle {cycle} succeeded")),
                cycle_at: started_at,
            };
            let actions = self.dispatcher.dispatch(&alert).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_alerts(transition, &actions);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_failures_alert_once() {
        let mut tracker = HealthTracker::default();
        let transitions: Vec<_> = [false, false, false, true, false]
            .into_iter()
            .filter_map(|success| tracker.observe(success))
            .collect();
        assert_eq!(
            transitions,
            vec![
                AlertTransition::Failing,
                AlertTransition::Recovered,
                AlertTransition::Failing
            ]
        );
        assert_eq!(tracker.state(), HealthState::Failing);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn successes_from_healthy_state_are_silent() {
        let mut tracker = HealthTracker::default();
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.observe(true), None);
        assert_eq!(tracker.state(), HealthState::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded() {
        let runner = ContinuousRunner::new(
            "vod",
            Duration::from_secs(50),
            Duration::ZERO,
            AlertDispatcher::new(Vec::new(), Duration::from_secs(1)),
        )
        .with_history_capacity(2);
        runner
            .run(
                |_, _| async {
                    sleep(Duration::from_secs(10)).await;
                    RunOutcome::success()
                },
                &CancellationToken::new(),
            )
            .await;
        let history = runner.history();
        assert_eq!(runner.status().cycles, 5);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cycle, 4);
    }
}
