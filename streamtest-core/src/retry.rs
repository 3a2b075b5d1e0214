use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ErrorKind, TesterResult, TesterError};

/// Bounded backoff for idempotent calls. Only transient network errors are
/// retried; every other kind is returned on first sight.
/// Runs `work` until it completes or `cancel` fires. A read still backing
/// off inside its retry policy is dropped as soon as the caller's lifetime
/// ends.
pub async fn until_cancelled<F, T>(cancel: &CancellationToken, work: F) -> TesterResult<T>
where
    F: Future<Output = TesterResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TesterError::cancelled()),
        result = work => result,
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    schedule: Vec<Duration>,
    jitter_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            vec![Duration::from_secs(1), Duration::from_secs(2)],
            250,
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, mut schedule: Vec<Duration>, jitter_ms: u64) -> Self {
        if schedule.is_empty() {
            schedule.push(Duration::from_secs(1));
        }
        Self {
            max_attempts: max_attempts.max(1),
            schedule,
            jitter_ms,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, vec![Duration::ZERO], 0)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            let base = self
                .schedule
                .get(attempt - 1)
                .or_else(|| self.schedule.last())
                .copied()
                .unwrap_or_default();
            if self.jitter_ms > 0 {
                let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
                base + Duration::from_millis(jitter)
            } else {
                base
            }
        }
    }

    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> TesterResult<RetryOutcome<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = TesterResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(TesterError::cancelled());
            }
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    })
                }
                Err(error) => {
                    attempt += 1;
                    if error.kind != ErrorKind::TransientNetwork || attempt >= self.max_attempts {
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient error"
                    );
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(TesterError::cancelled()),
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}
