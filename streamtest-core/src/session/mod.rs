//! Test sessions and the phases they run.

mod record;
mod transcode;
mod vod;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::MediaApi;
use crate::config::TesterConfig;
use crate::error::{TesterError, TesterResult};
use crate::geo::GeoPlan;
use crate::orchestrator::PhaseOrchestrator;
use crate::playback::PlaybackVerifier;
use crate::poller::TaskPoller;
use crate::simulator::StreamSimulator;

pub use record::LiveRecordPhase;
pub use transcode::TranscodePhase;
pub use vod::{VodPhase, VodPhaseKind};

/// A named unit of work run by `PhaseOrchestrator`.
///
/// `run` receives the phase's own lifetime; it is cancelled when the phase
/// deadline passes, a sibling fails or the session is cancelled.
#[async_trait]
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    fn deadline(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, cancel: CancellationToken) -> TesterResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Vod,
    Transcode,
    LiveRecord,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Vod => "vod",
            SessionKind::Transcode => "transcode",
            SessionKind::LiveRecord => "live_record",
        }
    }

    /// Label used for continuous runs, alerts and metrics.
    pub fn tester_name(self) -> &'static str {
        match self {
            SessionKind::Vod => "vod-tester",
            SessionKind::Transcode => "transcode-tester",
            SessionKind::LiveRecord => "record-tester",
        }
    }

    pub fn enabled(config: &TesterConfig) -> Vec<SessionKind> {
        let mut kinds = Vec::new();
        if config.vod.enabled {
            kinds.push(SessionKind::Vod);
        }
        if config.transcode.enabled {
            kinds.push(SessionKind::Transcode);
        }
        if config.live.enabled {
            kinds.push(SessionKind::LiveRecord);
        }
        kinds
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborators shared by every phase of one session.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<TesterConfig>,
    pub api: Arc<dyn MediaApi>,
    pub poller: TaskPoller,
    pub verifier: Arc<PlaybackVerifier>,
    pub simulator: Arc<dyn StreamSimulator>,
    pub geo: Option<Arc<GeoPlan>>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("server", &self.api.server())
            .field("poller", &self.poller)
            .field("geo", &self.geo)
            .finish()
    }
}

impl SessionContext {
    /// Host part used in generated names, without scheme or port.
    pub fn host_label(&self) -> String {
        let server = self.api.server();
        let without_scheme = server
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(server);
        without_scheme
            .split(&['/', ':'][..])
            .next()
            .unwrap_or(without_scheme)
            .to_string()
    }

    /// `{prefix}_{host}_{timestamp}` as used for assets and streams.
    pub fn resource_name(&self, prefix: &str) -> String {
        format!(
            "{prefix}_{}_{}",
            self.host_label(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    pub fn pipeline_strategy(&self) -> Option<&str> {
        self.config.api.catalyst_pipeline_strategy.as_deref()
    }

    /// Phases for every enabled workflow, in a stable order.
    pub fn build_phases(&self) -> Vec<Arc<dyn Phase>> {
        SessionKind::enabled(&self.config)
            .into_iter()
            .flat_map(|kind| self.phases_for(kind))
            .collect()
    }

    pub fn phases_for(&self, kind: SessionKind) -> Vec<Arc<dyn Phase>> {
        let mut phases: Vec<Arc<dyn Phase>> = Vec::new();
        match kind {
            SessionKind::Vod => {
                let vod = &self.config.vod;
                let switches = [
                    (vod.url_import, VodPhaseKind::UrlImport),
                    (vod.direct_upload, VodPhaseKind::DirectUpload),
                    (vod.resumable_upload, VodPhaseKind::ResumableUpload),
                ];
                for (enabled, phase) in switches {
                    if enabled {
                        phases.push(Arc::new(VodPhase::new(phase, self.clone())));
                    }
                }
            }
            SessionKind::Transcode => phases.push(Arc::new(TranscodePhase::new(self.clone()))),
            SessionKind::LiveRecord => phases.push(Arc::new(LiveRecordPhase::new(self.clone()))),
        }
        phases
    }
}

/// Final result of one session or of the whole run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub error: Option<TesterError>,
}

impl RunOutcome {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            error: None,
        }
    }

    /// Cancellation maps to a clean exit with no error attached.
    pub fn from_result(result: TesterResult<()>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(err) if err.is_cancelled() => Self::success(),
            Err(err) => Self {
                exit_code: err.exit_code(),
                error: Some(err),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One run of the orchestrator with its own lifetime and config snapshot.
/// Once its lifetime is cancelled it never resumes.
pub struct TestSession {
    id: Uuid,
    config: Arc<TesterConfig>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    outcome: OnceCell<RunOutcome>,
}

impl fmt::Debug for TestSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestSession")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TestSession {
    pub fn new(config: Arc<TesterConfig>, parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            cancel: parent.child_token(),
            started_at: Utc::now(),
            outcome: OnceCell::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.get().cloned()
    }

    /// Runs `phases` to completion and records the outcome. A session runs
    /// at most once: concurrent callers wait for the first run and every
    /// caller gets the same outcome.
    pub async fn run(
        &self,
        orchestrator: &PhaseOrchestrator,
        phases: Vec<Arc<dyn Phase>>,
    ) -> RunOutcome {
        self.outcome
            .get_or_init(|| self.execute(orchestrator, phases))
            .await
            .clone()
    }

    async fn execute(
        &self,
        orchestrator: &PhaseOrchestrator,
        phases: Vec<Arc<dyn Phase>>,
    ) -> RunOutcome {
        info!(session = %self.id, phases = phases.len(), "session started");
        let result = if self.cancel.is_cancelled() {
            Err(TesterError::cancelled())
        } else {
            orchestrator.run(phases, &self.cancel).await
        };
        // The lifetime ends with the session.
        self.cancel.cancel();
        let outcome = RunOutcome::from_result(result);
        match &outcome.error {
            Some(err) => warn!(session = %self.id, error = %err, "session failed"),
            None => info!(session = %self.id, "session finished"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPhase {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Phase for CountingPhase {
        fn name(&self) -> &str {
            "direct-upload"
        }

        async fn run(&self, _cancel: CancellationToken) -> TesterResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(TesterError::verification("no duration"))
        }
    }

    fn config() -> Arc<TesterConfig> {
        let config: TesterConfig = toml::from_str(
            r#"
            [api]
            server = "studio.test"
            access_token = "token"
            "#,
        )
        .unwrap();
        Arc::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_execute_phases_once() {
        let phase = Arc::new(CountingPhase {
            runs: AtomicUsize::new(0),
        });
        let session = TestSession::new(config(), &CancellationToken::new());
        let orchestrator = PhaseOrchestrator::new();
        let phases = || vec![phase.clone() as Arc<dyn Phase>];

        let (first, second) = tokio::join!(
            session.run(&orchestrator, phases()),
            session.run(&orchestrator, phases()),
        );
        assert_eq!(phase.runs.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first.exit_code, 1);
        assert_eq!(session.outcome(), Some(first.clone()));

        let again = session.run(&orchestrator, phases()).await;
        assert_eq!(again, first);
        assert_eq!(phase.runs.load(Ordering::SeqCst), 1);
        assert!(session.is_cancelled());
    }
}
