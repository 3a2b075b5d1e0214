use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{MediaApi, Task, TaskPhase};
use crate::config::PollingSection;
use crate::error::{TesterError, TesterResult};
use crate::retry::until_cancelled;

/// Polls a remote task until it reaches a terminal state, its deadline passes
/// or the lifetime is cancelled.
#[derive(Debug, Clone, Copy)]
pub struct TaskPoller {
    interval: Duration,
    deadline: Duration,
}

impl TaskPoller {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            deadline,
        }
    }

    pub fn from_config(polling: &PollingSection) -> Self {
        Self::new(polling.task_poll_interval(), polling.task_deadline())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The first status check happens immediately. Between checks the poller
    /// waits `interval`, shortened so the wait never runs past the deadline.
    pub async fn poll(
        &self,
        api: &dyn MediaApi,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> TesterResult<Task> {
        let started = Instant::now();
        let mut checks = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(TesterError::cancelled().with_task(task_id));
            }
            let task = until_cancelled(cancel, api.get_task(task_id))
                .await
                .map_err(|err| err.wrap("error retrieving task").with_task(task_id))?;
            checks += 1;
            debug!(task_id, phase = ?task.phase(), progress = ?task.status.progress, "task status");
            match task.phase() {
                TaskPhase::Succeeded => {
                    info!(task_id, checks, elapsed_ms = started.elapsed().as_millis() as u64, "task succeeded");
                    return Ok(task);
                }
                TaskPhase::Failed => {
                    let reason = task
                        .status
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "no error message".to_string());
                    return Err(TesterError::remote_failure(format!("task failed: {reason}"))
                        .with_task(task_id));
                }
                TaskPhase::Pending | TaskPhase::Running => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                return Err(TesterError::deadline_exceeded(format!(
                    "task still {:?} after {}s",
                    task.phase(),
                    elapsed.as_secs()
                ))
                .with_task(task_id));
            }
            let wait = self.interval.min(self.deadline - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TesterError::cancelled().with_task(task_id));
                }
                _ = sleep(wait) => {}
            }
        }
    }
}
