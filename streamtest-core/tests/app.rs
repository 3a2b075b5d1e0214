mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{vod_config, IdleSimulator, MockMediaApi, ScriptedInspector, StaticNodes};
use streamtest_core::{ErrorKind, GeoNode, RunMode, TesterApp, TesterConfig, TesterMetrics};
use tempfile::NamedTempFile;

fn app(config: TesterConfig, api: Arc<MockMediaApi>) -> TesterApp {
    TesterApp::new(
        config,
        api,
        Arc::new(ScriptedInspector::ready(3)),
        Arc::new(IdleSimulator),
    )
}

#[tokio::test(start_paused = true)]
async fn single_vod_run_succeeds() {
    let file = NamedTempFile::new().unwrap();
    let api = Arc::new(MockMediaApi::new());
    let app = app(vod_config(file.path()), Arc::clone(&api));

    let outcome = app.start(RunMode::Single).await;
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.error, None);
    assert_eq!(api.uploads.lock().unwrap().len(), 2);
    assert!(api
        .uploads
        .lock()
        .unwrap()
        .iter()
        .all(|(_, path)| path == file.path()));
    app.done().await;
}

#[tokio::test(start_paused = true)]
async fn failed_upload_names_phase_and_task() {
    let file = NamedTempFile::new().unwrap();
    let mut config = vod_config(file.path());
    config.vod.url_import = false;
    config.vod.resumable_upload = false;
    let api = Arc::new(MockMediaApi::new());
    api.fail_task("upload-task-0", "file could not be processed");
    let app = app(config, Arc::clone(&api));

    let outcome = app.start(RunMode::Single).await;
    assert_eq!(outcome.exit_code, 1);
    let err = outcome.error.unwrap();
    assert_eq!(err.kind, ErrorKind::RemoteFailure);
    assert_eq!(err.phase(), Some("direct-upload"));
    assert_eq!(err.context.task_id.as_deref(), Some("upload-task-0"));
    assert_eq!(err.context.asset_id.as_deref(), Some("upload-asset-0"));
    assert!(err.message.contains("file could not be processed"));
}

#[tokio::test(start_paused = true)]
async fn invalid_config_fails_before_any_call() {
    let file = NamedTempFile::new().unwrap();
    let mut config = vod_config(file.path());
    config.api.access_token = None;
    let api = Arc::new(MockMediaApi::new());
    let app = app(config, Arc::clone(&api));

    let outcome = app.start(RunMode::Single).await;
    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.error.unwrap().kind, ErrorKind::Configuration);
    assert_eq!(api.task_checks.load(Ordering::SeqCst), 0);
    assert!(api.uploads.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_exits_cleanly() {
    let file = NamedTempFile::new().unwrap();
    let api = Arc::new(MockMediaApi::new());
    let app = app(vod_config(file.path()), Arc::clone(&api));
    app.cancel();

    let outcome = app.start(RunMode::Single).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.error, None);
    assert!(api.uploads.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn continuous_run_records_every_cycle() {
    let file = NamedTempFile::new().unwrap();
    let mut config = vod_config(file.path());
    // Each mock cycle takes one task poll interval (5s).
    config.continuous.total_duration_seconds = Some(30);
    let api = Arc::new(MockMediaApi::new());
    let metrics = TesterMetrics::new().unwrap();
    let app = app(config, api).with_metrics(metrics.clone());

    let outcome = app.start(RunMode::Continuous).await;
    assert!(outcome.is_success());
    let statuses = app.status();
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.cycles, 6);
    assert_eq!(status.failures, 0);
    assert_eq!(status.tester, "vod-tester");
    assert!(metrics
        .render()
        .unwrap()
        .contains("streamtest_cycles_total{tester=\"vod-tester\"} 6"));
}

#[tokio::test(start_paused = true)]
async fn continuous_mode_requires_total_duration() {
    let file = NamedTempFile::new().unwrap();
    let app = app(vod_config(file.path()), Arc::new(MockMediaApi::new()));

    let outcome = app.start(RunMode::Continuous).await;
    assert_eq!(outcome.exit_code, 1);
    assert!(app.status().is_empty());
}

#[tokio::test(start_paused = true)]
async fn live_record_pulls_through_selected_nodes() {
    let file = NamedTempFile::new().unwrap();
    let mut config: TesterConfig = toml::from_str(&format!(
        r#"
        [api]
        server = "studio.test"
        access_token = "token"

        [live]
        enabled = true
        file = "{}"
        stream_duration_seconds = 10

        [geo]
        enabled = true
        node_source = "nodes.json"
        pull_count = 2
        latitude = 40.7
        longitude = -74.0
        "#,
        file.path().display()
    ))
    .unwrap();
    config.polling.task_poll_interval_seconds = 5;
    let api = Arc::new(MockMediaApi::new());
    api.add_hls_playback("rec-pb");
    let inspector = Arc::new(ScriptedInspector::ready(3));
    let nodes = vec![
        GeoNode::new("nyc-1", "nyc-1.example.net").with_location("40.71", "-74.00"),
        GeoNode::new("lon-1", "lon-1.example.net").with_location("51.50", "-0.12"),
        GeoNode::new("chi-1", "chi-1.example.net").with_location("41.87", "-87.62"),
    ];
    let app = TesterApp::new(
        config,
        Arc::clone(&api) as Arc<dyn streamtest_core::MediaApi>,
        Arc::clone(&inspector) as Arc<dyn streamtest_core::ManifestInspector>,
        Arc::new(IdleSimulator),
    )
    .with_node_source(Arc::new(StaticNodes(nodes)));

    let outcome = app.start(RunMode::Single).await;
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(*api.deleted_streams.lock().unwrap(), vec!["stream-1".to_string()]);
    let urls = inspector.urls.lock().unwrap();
    assert_eq!(urls.len(), 3);
    assert_eq!(urls[0], "https://cdn.test/hls/rec-pb/index.m3u8");
    assert_eq!(urls[1], "https://nyc-1.example.net/hls/rec-pb/index.m3u8");
    assert_eq!(urls[2], "https://chi-1.example.net/hls/rec-pb/index.m3u8");
}

fn record_config(file: &NamedTempFile) -> TesterConfig {
    toml::from_str(&format!(
        r#"
        [api]
        server = "studio.test"
        access_token = "token"

        [live]
        enabled = true
        file = "{}"
        stream_duration_seconds = 10
        "#,
        file.path().display()
    ))
    .unwrap()
}

fn record_app(config: TesterConfig, api: &Arc<MockMediaApi>, inspector: &Arc<ScriptedInspector>) -> TesterApp {
    TesterApp::new(
        config,
        Arc::clone(api) as Arc<dyn streamtest_core::MediaApi>,
        Arc::clone(inspector) as Arc<dyn streamtest_core::ManifestInspector>,
        Arc::new(IdleSimulator),
    )
    .with_simulation_stagger(Duration::from_secs(5), Duration::from_secs(5))
}

#[tokio::test(start_paused = true)]
async fn simulated_streams_run_staggered_and_all_pass() {
    let file = NamedTempFile::new().unwrap();
    let api = Arc::new(MockMediaApi::new());
    api.add_hls_playback("rec-pb");
    let inspector = Arc::new(ScriptedInspector::ready(3));
    let app = record_app(record_config(&file), &api, &inspector);

    let report = app.simulate(3).await;
    assert!(report.outcome.is_success(), "{report:?}");
    assert_eq!(report.streams, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.success_percent(), 100.0);
    // Starts at 0s, 5s and 10s; each stream pushes for 10s.
    assert_eq!(report.elapsed_ms, 20_000);
    assert_eq!(api.deleted_streams.lock().unwrap().len(), 3);
    assert_eq!(inspector.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn one_failing_stream_does_not_stop_the_others() {
    let file = NamedTempFile::new().unwrap();
    let api = Arc::new(MockMediaApi::new());
    api.add_hls_playback("rec-pb");
    let inspector = Arc::new(ScriptedInspector::new(&[Some(4), Some(1)]));
    let app = record_app(record_config(&file), &api, &inspector);

    let report = app.simulate(3).await;
    assert_eq!(report.streams, 3);
    assert_eq!(report.succeeded, 1);
    assert!((report.success_percent() - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(report.outcome.exit_code, 1);
    let err = report.outcome.error.as_ref().unwrap();
    assert_eq!(err.kind, ErrorKind::Verification);
    assert_eq!(err.phase(), Some("live-record"));
    assert!(err.message.contains("insufficient renditions: 1"));
    // The last stream still ran to its own verification deadline.
    assert_eq!(report.elapsed_ms, 40_000);
    assert_eq!(api.deleted_streams.lock().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn simulation_requires_live_record_session() {
    let file = NamedTempFile::new().unwrap();
    let api = Arc::new(MockMediaApi::new());
    let inspector = Arc::new(ScriptedInspector::ready(3));
    let app = record_app(vod_config(file.path()), &api, &inspector);

    let report = app.simulate(2).await;
    assert_eq!(report.outcome.exit_code, 1);
    assert_eq!(report.streams, 0);
    let err = report.outcome.error.unwrap();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert!(err.message.contains("live.enabled"));
    assert_eq!(api.task_checks.load(Ordering::SeqCst), 0);
}
