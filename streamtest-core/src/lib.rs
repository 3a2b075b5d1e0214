pub mod alert;
pub mod api;
pub mod app;
pub mod config;
pub mod continuous;
pub mod error;
pub mod geo;
pub mod manifest;
pub mod metrics;
pub mod orchestrator;
pub mod playback;
pub mod poller;
pub mod retry;
pub mod session;
pub mod simulator;

pub use alert::{
    notifiers_from_config, Alert, AlertDispatcher, AlertError, AlertTransition, DiscordNotifier,
    DispatchAction, DispatchStatus, LogNotifier, Notifier, PagerDutyNotifier,
};
pub use api::{
    patch_url_host, ApiError, Asset, CreateStreamRequest, HttpMediaApi, Ingest, MediaApi,
    PlaybackInfo, PlaybackMeta, PlaybackSource, Stream, StreamSession, Task, TaskPhase, TaskRef,
    TaskStatus, TranscodeRequest, UploadRequest, VideoSpec, HLS_SOURCE_TYPE,
};
pub use app::{SimulationReport, TesterApp};
pub use config::{
    load_tester_config, AlertsSection, ApiSection, ContinuousSection, DiscordSection, GeoSection,
    LiveSection, MetricsSection, PagerDutySection, PollingSection, RunMode, TesterConfig,
    TranscodeSection, VodSection,
};
pub use continuous::{ContinuousRunner, CycleResult, HealthState, HealthTracker, RunnerStatus};
pub use error::{ConfigError, ErrorContext, ErrorKind, Result, TesterError, TesterResult};
pub use geo::{
    haversine_km, node_source_from_spec, rank_groups, select_closest, Coordinates,
    FileNodeSource, GeoNode, GeoPlan, HttpNodeSource, NodeGroup, NodeSource, EARTH_RADIUS_KM,
};
pub use manifest::{
    HlsManifestInspector, ManifestError, ManifestInspector, ManifestStats, Playlist,
    RenditionStats,
};
pub use metrics::TesterMetrics;
pub use orchestrator::PhaseOrchestrator;
pub use playback::PlaybackVerifier;
pub use poller::TaskPoller;
pub use retry::{until_cancelled, RetryOutcome, RetryPolicy};
pub use session::{
    LiveRecordPhase, Phase, RunOutcome, SessionContext, SessionKind, TestSession, TranscodePhase,
    VodPhase, VodPhaseKind,
};
pub use simulator::{FfmpegStreamSimulator, StreamSimulator};
