use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TesterError, TesterResult};
use crate::session::Phase;

/// Runs phases concurrently under one cancellation scope.
///
/// Every phase gets its own child lifetime. The first failure, by completion
/// order, cancels the scope; the orchestrator still waits for every phase to
/// return before reporting that failure.
#[derive(Debug, Clone, Default)]
pub struct PhaseOrchestrator {
    default_deadline: Option<Duration>,
}

impl PhaseOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline applied to phases that do not declare their own.
    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub async fn run(
        &self,
        phases: Vec<Arc<dyn Phase>>,
        parent: &CancellationToken,
    ) -> TesterResult<()> {
        let scope = parent.child_token();
        let mut running = JoinSet::new();
        for phase in phases {
            let deadline = phase.deadline().or(self.default_deadline);
            running.spawn(run_phase(phase, scope.child_token(), deadline));
        }

        let mut first_error: Option<TesterError> = None;
        let mut saw_cancel = false;
        while let Some(joined) = running.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(TesterError::internal(format!("phase task failed: {err}")))
            });
            match result {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => saw_cancel = true,
                Err(err) if first_error.is_none() => {
                    warn!(error = %err, "phase failed, cancelling siblings");
                    scope.cancel();
                    first_error = Some(err);
                }
                Err(err) => debug!(error = %err, "later phase failure ignored"),
            }
        }
        scope.cancel();

        match first_error {
            Some(err) => Err(err),
            None if saw_cancel => Err(TesterError::cancelled()),
            None => Ok(()),
        }
    }
}

async fn run_phase(
    phase: Arc<dyn Phase>,
    cancel: CancellationToken,
    deadline: Option<Duration>,
) -> TesterResult<()> {
    let name = phase.name().to_string();
    let started = Instant::now();
    info!(phase = %name, "phase started");

    let work = phase.run(cancel.clone());
    tokio::pin!(work);
    let result = match deadline {
        None => work.await,
        Some(limit) => match timeout(limit, &mut work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(phase = %name, deadline_secs = limit.as_secs(), "phase deadline passed");
                cancel.cancel();
                // Not aborted: the phase returns at its next suspension point.
                match work.await {
                    Err(err) if err.is_cancelled() => Err(TesterError::deadline_exceeded(
                        format!("phase exceeded its deadline of {}s", limit.as_secs()),
                    )),
                    other => other,
                }
            }
        },
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(()) => info!(phase = %name, elapsed_ms, "phase succeeded"),
        Err(err) if err.is_cancelled() => info!(phase = %name, elapsed_ms, "phase cancelled"),
        Err(err) => warn!(phase = %name, elapsed_ms, error = %err, "phase failed"),
    }
    result.map_err(|err| err.with_phase(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::sleep;

    struct TimedPhase {
        name: &'static str,
        after: Duration,
        fail: Option<TesterError>,
        deadline: Option<Duration>,
        saw_cancel: AtomicBool,
    }

    impl TimedPhase {
        fn ok(name: &'static str, after: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                after,
                fail: None,
                deadline: None,
                saw_cancel: AtomicBool::new(false),
            })
        }

        fn failing(name: &'static str, after: Duration, err: TesterError) -> Arc<Self> {
            Arc::new(Self {
                name,
                after,
                fail: Some(err),
                deadline: None,
                saw_cancel: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Phase for TimedPhase {
        fn name(&self) -> &str {
            self.name
        }

        fn deadline(&self) -> Option<Duration> {
            self.deadline
        }

        async fn run(&self, cancel: CancellationToken) -> TesterResult<()> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    Err(TesterError::cancelled())
                }
                _ = sleep(self.after) => match &self.fail {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_phases_succeeding_is_success() {
        let phases: Vec<Arc<dyn Phase>> = vec![
            TimedPhase::ok("url-import", Duration::from_secs(3)),
            TimedPhase::ok("direct-upload", Duration::from_secs(1)),
        ];
        PhaseOrchestrator::new()
            .run(phases, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_failure_cancels_siblings() {
        let slow = TimedPhase::ok("url-import", Duration::from_secs(600));
        let failing = TimedPhase::failing(
            "direct-upload",
            Duration::from_secs(2),
            TesterError::verification("no duration"),
        );
        let phases: Vec<Arc<dyn Phase>> = vec![slow.clone(), failing];
        let started = Instant::now();
        let err = PhaseOrchestrator::new()
            .run(phases, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Verification);
        assert_eq!(err.phase(), Some("direct-upload"));
        assert!(slow.saw_cancel.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_reported_distinctly() {
        let phase = Arc::new(TimedPhase {
            name: "transcode",
            after: Duration::from_secs(120),
            fail: None,
            deadline: Some(Duration::from_secs(10)),
            saw_cancel: AtomicBool::new(false),
        });
        let err = PhaseOrchestrator::new()
            .run(vec![phase.clone() as Arc<dyn Phase>], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert_eq!(err.phase(), Some("transcode"));
        assert!(phase.saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn default_deadline_applies_to_phases_without_one() {
        let phases: Vec<Arc<dyn Phase>> =
            vec![TimedPhase::ok("resumable-upload", Duration::from_secs(90))];
        let started = Instant::now();
        let err = PhaseOrchestrator::new()
            .with_default_deadline(Some(Duration::from_secs(15)))
            .run(phases, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert!(started.elapsed() < Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_is_not_a_failure() {
        let parent = CancellationToken::new();
        let phases: Vec<Arc<dyn Phase>> =
            vec![TimedPhase::ok("live-record", Duration::from_secs(600))];
        let trigger = parent.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = PhaseOrchestrator::new().run(phases, &parent).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.exit_code(), 0);
    }
}
