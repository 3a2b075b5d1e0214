mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{MockMediaApi, ScriptedInspector};
use streamtest_core::{ErrorKind, PlaybackSource, PlaybackVerifier};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn verifier(api: Arc<MockMediaApi>, inspector: Arc<ScriptedInspector>) -> PlaybackVerifier {
    PlaybackVerifier::new(api, inspector, Duration::from_secs(20), Duration::from_secs(2))
}

#[tokio::test(start_paused = true)]
async fn playable_asset_is_verified() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 120.0);
    api.add_hls_playback("pb1");
    let inspector = Arc::new(ScriptedInspector::new(&[None, Some(1), Some(4)]));

    let started = Instant::now();
    let stats = verifier(api, Arc::clone(&inspector))
        .verify("a1", 60.0, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stats.rendition_count(), 4);
    assert_eq!(inspector.calls.load(Ordering::SeqCst), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn zero_duration_fails() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 0.0);
    let inspector = Arc::new(ScriptedInspector::ready(4));

    let err = verifier(api, Arc::clone(&inspector))
        .verify("a1", 0.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Verification);
    assert_eq!(err.message, "no duration");
    assert_eq!(err.context.asset_id.as_deref(), Some("a1"));
    assert_eq!(inspector.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn short_asset_fails() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 30.0);
    api.add_hls_playback("pb1");

    let err = verifier(api, Arc::new(ScriptedInspector::ready(4)))
        .verify("a1", 60.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Verification);
    assert!(err.message.contains("shorter than expected"));
}

#[tokio::test(start_paused = true)]
async fn missing_hls_source_fails() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 120.0);
    api.add_playback(
        "pb1",
        vec![PlaybackSource {
            hrn: Some("MP4".into()),
            kind: "html5/video/mp4".into(),
            url: "https://cdn.test/static/pb1/720p.mp4".into(),
        }],
    );

    let err = verifier(api, Arc::new(ScriptedInspector::ready(4)))
        .verify("a1", 0.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Verification);
    assert_eq!(err.message, "no streaming source");
}

#[tokio::test(start_paused = true)]
async fn single_rendition_times_out() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 120.0);
    api.add_hls_playback("pb1");

    let started = Instant::now();
    let err = verifier(api, Arc::new(ScriptedInspector::ready(1)))
        .verify("a1", 0.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Verification);
    assert!(err.message.starts_with("insufficient renditions: 1"));
    assert_eq!(started.elapsed(), Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn unavailable_manifest_is_reported() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 120.0);
    api.add_hls_playback("pb1");

    let err = verifier(api, Arc::new(ScriptedInspector::new(&[None])))
        .verify("a1", 0.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.message.starts_with("manifest not available"));
    assert!(err.message.contains("404"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_waiting() {
    let api = Arc::new(MockMediaApi::new());
    api.add_asset("a1", Some("pb1"), 120.0);
    api.add_hls_playback("pb1");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = verifier(api, Arc::new(ScriptedInspector::ready(1)))
        .verify("a1", 0.0, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}
