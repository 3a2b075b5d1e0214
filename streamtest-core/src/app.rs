use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::alert::{notifiers_from_config, AlertDispatcher};
use crate::api::{HttpMediaApi, MediaApi};
use crate::config::{RunMode, TesterConfig};
use crate::continuous::{ContinuousRunner, RunnerStatus};
use crate::error::{TesterError, TesterResult};
use crate::geo::{node_source_from_spec, Coordinates, GeoPlan, NodeSource};
use crate::manifest::{HlsManifestInspector, ManifestInspector};
use crate::metrics::TesterMetrics;
use crate::orchestrator::PhaseOrchestrator;
use crate::playback::PlaybackVerifier;
use crate::poller::TaskPoller;
use crate::session::{RunOutcome, SessionContext, SessionKind, TestSession};
use crate::simulator::{FfmpegStreamSimulator, StreamSimulator};

const RECORD_ONLY: &[SessionKind] = &[SessionKind::LiveRecord];
const DEFAULT_STAGGER: (Duration, Duration) = (Duration::from_secs(3), Duration::from_secs(7));

/// Result of a concurrent record-tester load run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationReport {
    /// Streams actually started; fewer than requested after a shutdown.
    pub streams: usize,
    pub succeeded: usize,
    pub elapsed_ms: u64,
    /// Exit code and the first failure observed, by completion order.
    pub outcome: RunOutcome,
}

impl SimulationReport {
    fn from_outcomes(outcomes: Vec<RunOutcome>, elapsed: Duration) -> Self {
        let streams = outcomes.len();
        let succeeded = outcomes.iter().filter(|outcome| outcome.is_success()).count();
        let outcome = outcomes
            .into_iter()
            .find(|outcome| !outcome.is_success())
            .unwrap_or_else(RunOutcome::success);
        Self {
            streams,
            succeeded,
            elapsed_ms: elapsed.as_millis() as u64,
            outcome,
        }
    }

    fn rejected(err: TesterError) -> Self {
        Self {
            streams: 0,
            succeeded: 0,
            elapsed_ms: 0,
            outcome: RunOutcome::from_result(Err(err)),
        }
    }

    pub fn success_percent(&self) -> f64 {
        if self.streams == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.streams as f64 * 100.0
    }
}

/// Embedding entry point: owns the root lifetime and tracks every task it
/// spawns so shutdown can be awaited.
pub struct TesterApp {
    inner: AppInner,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Clone)]
struct AppInner {
    config: Arc<TesterConfig>,
    api: Arc<dyn MediaApi>,
    inspector: Arc<dyn ManifestInspector>,
    simulator: Arc<dyn StreamSimulator>,
    node_source: Option<Arc<dyn NodeSource>>,
    dispatcher: AlertDispatcher,
    metrics: Option<TesterMetrics>,
    runners: Arc<Mutex<Vec<Arc<ContinuousRunner>>>>,
    stagger: (Duration, Duration),
}

impl fmt::Debug for TesterApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TesterApp")
            .field("server", &self.inner.api.server())
            .field("dispatcher", &self.inner.dispatcher)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl TesterApp {
    pub fn new(
        config: TesterConfig,
        api: Arc<dyn MediaApi>,
        inspector: Arc<dyn ManifestInspector>,
        simulator: Arc<dyn StreamSimulator>,
    ) -> Self {
        let dispatcher = AlertDispatcher::new(Vec::new(), config.continuous.alert_send_timeout());
        Self {
            inner: AppInner {
                config: Arc::new(config),
                api,
                inspector,
                simulator,
                node_source: None,
                dispatcher,
                metrics: None,
                runners: Arc::new(Mutex::new(Vec::new())),
                stagger: DEFAULT_STAGGER,
            },
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Production wiring: HTTP API client, HLS inspector, ffmpeg, configured
    /// node source and alert transports.
    pub fn from_config(config: TesterConfig) -> TesterResult<Self> {
        let client = Client::builder()
            .timeout(config.api.request_timeout())
            .build()
            .map_err(|err| TesterError::internal(format!("failed to build http client: {err}")))?;
        let cancel = CancellationToken::new();
        let api = HttpMediaApi::from_config(&config.api)?.with_cancel(cancel.clone());
        let node_source = match (config.geo.enabled, &config.geo.node_source) {
            (true, Some(spec)) => Some(node_source_from_spec(client.clone(), spec)),
            _ => None,
        };
        let dispatcher = AlertDispatcher::new(
            notifiers_from_config(&client, &config.alerts),
            config.continuous.alert_send_timeout(),
        );
        let metrics = if config.metrics.enabled {
            Some(TesterMetrics::new().map_err(|err| {
                TesterError::internal(format!("failed to register metrics: {err}"))
            })?)
        } else {
            None
        };
        let mut app = Self::new(
            config,
            Arc::new(api),
            Arc::new(HlsManifestInspector::new(client)),
            Arc::new(FfmpegStreamSimulator::default()),
        )
        .with_dispatcher(dispatcher);
        app.cancel = cancel;
        app.inner.node_source = node_source;
        app.inner.metrics = metrics;
        Ok(app)
    }

    pub fn with_node_source(mut self, source: Arc<dyn NodeSource>) -> Self {
        self.inner.node_source = Some(source);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: AlertDispatcher) -> Self {
        self.inner.dispatcher = dispatcher;
        self
    }

    pub fn with_metrics(mut self, metrics: TesterMetrics) -> Self {
        self.inner.metrics = Some(metrics);
        self
    }

    /// Bounds of the random wait between simulated stream starts.
    pub fn with_simulation_stagger(mut self, min: Duration, max: Duration) -> Self {
        self.inner.stagger = (min, max.max(min));
        self
    }

    pub fn config(&self) -> &TesterConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Option<&TesterMetrics> {
        self.inner.metrics.as_ref()
    }

    /// Handle that cancels the whole run when fired.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once every task started by this app has returned.
    pub async fn done(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Status of every continuous runner, one per enabled session kind.
    /// Empty until a continuous run has started.
    pub fn status(&self) -> Vec<RunnerStatus> {
        let runners = match self.inner.runners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runners.iter().map(|runner| runner.status()).collect()
    }

    /// Validates the configuration, then runs once or loops until the total
    /// duration passes. Configuration errors fail before any cycle starts.
    pub async fn start(&self, mode: RunMode) -> RunOutcome {
        if let Err(err) = self.inner.config.validate(mode) {
            return RunOutcome::from_result(Err(err.into()));
        }
        let inner = Arc::new(self.inner.clone());
        let cancel = self.cancel.clone();
        let handle = self
            .tracker
            .spawn(async move { inner.run(mode, cancel).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => RunOutcome::from_result(Err(TesterError::internal(format!(
                "tester task failed: {err}"
            )))),
        }
    }
}

impl TesterApp {
    /// Load run: starts `streams` independent live-record sessions with a
    /// random stagger between starts and waits for all of them. A failing
    /// stream does not cancel the others.
    pub async fn simulate(&self, streams: usize) -> SimulationReport {
        if let Err(err) = self.check_simulation(streams) {
            return SimulationReport::rejected(err);
        }
        let inner = Arc::new(self.inner.clone());
        let cancel = self.cancel.clone();
        let handle = self
            .tracker
            .spawn(async move { inner.simulate(streams, cancel).await });
        match handle.await {
            Ok(report) => report,
            Err(err) => SimulationReport::rejected(TesterError::internal(format!(
                "simulation task failed: {err}"
            ))),
        }
    }

    fn check_simulation(&self, streams: usize) -> TesterResult<()> {
        self.inner.config.validate(RunMode::Single)?;
        if !self.inner.config.live.enabled {
            return Err(TesterError::configuration(
                "live.enabled should be set to simulate streams",
            ));
        }
        if streams == 0 {
            return Err(TesterError::configuration(
                "number of simulated streams should be at least 1",
            ));
        }
        Ok(())
    }
}

impl AppInner {
    async fn run(&self, mode: RunMode, cancel: CancellationToken) -> RunOutcome {
        let kinds = SessionKind::enabled(&self.config);
        info!(server = %self.api.server(), ?mode, ?kinds, "tester starting");
        match mode {
            RunMode::Single => self.run_cycle(&kinds, 1, cancel).await,
            RunMode::Continuous => {
                let runners: Vec<(SessionKind, Arc<ContinuousRunner>)> = kinds
                    .iter()
                    .map(|&kind| (kind, Arc::new(self.runner_for(kind))))
                    .collect();
                {
                    let mut slot = match self.runners.lock() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *slot = runners.iter().map(|(_, runner)| Arc::clone(runner)).collect();
                }
                let cancel = &cancel;
                let loops = runners.iter().map(|(kind, runner)| {
                    let kinds = std::slice::from_ref(kind);
                    async move {
                        runner
                            .run(|cycle, token| self.run_cycle(kinds, cycle, token), cancel)
                            .await
                    }
                });
                // Runners never fail the process; cycle failures go to alerts.
                join_all(loops).await;
                RunOutcome::success()
            }
        }
    }

    async fn simulate(self: Arc<Self>, streams: usize, cancel: CancellationToken) -> SimulationReport {
        let started = Instant::now();
        let mut running = JoinSet::new();
        for index in 0..streams {
            let inner = Arc::clone(&self);
            let token = cancel.clone();
            let cycle = index as u64 + 1;
            running.spawn(async move { inner.run_cycle(RECORD_ONLY, cycle, token).await });
            if index + 1 == streams {
                break;
            }
            let wait = self.stagger_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        let mut outcomes = Vec::with_capacity(streams);
        while let Some(joined) = running.join_next().await {
            outcomes.push(joined.unwrap_or_else(|err| {
                RunOutcome::from_result(Err(TesterError::internal(format!(
                    "record tester failed: {err}"
                ))))
            }));
        }
        let report = SimulationReport::from_outcomes(outcomes, started.elapsed());
        info!(
            streams = report.streams,
            succeeded = report.succeeded,
            elapsed_ms = report.elapsed_ms,
            success_percent = report.success_percent(),
            "simulated streams finished"
        );
        report
    }

    fn stagger_delay(&self) -> Duration {
        let (min, max) = self.stagger;
        let spread = (max - min).as_millis() as u64;
        if spread == 0 {
            return min;
        }
        min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }

    fn runner_for(&self, kind: SessionKind) -> ContinuousRunner {
        let runner = ContinuousRunner::from_config(
            kind.tester_name(),
            &self.config.continuous,
            self.dispatcher.clone(),
        );
        match &self.metrics {
            Some(metrics) => runner.with_metrics(metrics.clone()),
            None => runner,
        }
    }

    async fn geo_plan(&self, cancel: &CancellationToken) -> TesterResult<Option<Arc<GeoPlan>>> {
        let geo = &self.config.geo;
        let Some(source) = self.node_source.as_ref().filter(|_| geo.enabled) else {
            return Ok(None);
        };
        let members = source.members(cancel).await?;
        let origin = Coordinates::new(geo.latitude, geo.longitude);
        let plan = GeoPlan::build(
            &members,
            origin,
            geo.node_count,
            geo.pull_count,
            geo.random_member,
        );
        let pulled: Vec<&str> = plan.pull.iter().map(|node| node.name.as_str()).collect();
        info!(members = members.len(), closest = plan.closest.len(), pulled = ?pulled, "selected nodes");
        Ok(Some(Arc::new(plan)))
    }

    async fn run_cycle(
        &self,
        kinds: &[SessionKind],
        cycle: u64,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let geo = match self.geo_plan(&cancel).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(cycle, error = %err, "node selection failed");
                return RunOutcome::from_result(Err(err.with_phase("geo-select")));
            }
        };
        let ctx = SessionContext {
            config: Arc::clone(&self.config),
            api: Arc::clone(&self.api),
            poller: TaskPoller::from_config(&self.config.polling),
            verifier: Arc::new(PlaybackVerifier::from_config(
                Arc::clone(&self.api),
                Arc::clone(&self.inspector),
                &self.config.polling,
            )),
            simulator: Arc::clone(&self.simulator),
            geo,
        };
        let session = TestSession::new(Arc::clone(&self.config), &cancel);
        let phases = kinds
            .iter()
            .flat_map(|&kind| ctx.phases_for(kind))
            .collect();
        info!(cycle, session = %session.id(), ?kinds, "running session");
        session.run(&PhaseOrchestrator::new(), phases).await
    }
}
