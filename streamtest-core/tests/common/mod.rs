#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use streamtest_core::{
    Asset, CreateStreamRequest, GeoNode, Ingest, ManifestInspector, ManifestStats, MediaApi,
    NodeSource, PlaybackInfo, PlaybackMeta, PlaybackSource, RenditionStats, Stream, StreamSession,
    StreamSimulator, Task, TaskPhase, TaskRef, TesterConfig, TesterError, TesterResult,
    TranscodeRequest, UploadRequest, VideoSpec, HLS_SOURCE_TYPE,
};
use tokio_util::sync::CancellationToken;

/// Scripted media API. Task phases are consumed one per `get_task` call; the
/// last scripted phase repeats.
#[derive(Default)]
pub struct MockMediaApi {
    tasks: Mutex<HashMap<String, VecDeque<(TaskPhase, Option<String>)>>>,
    assets: Mutex<HashMap<String, Asset>>,
    playback: Mutex<HashMap<String, PlaybackInfo>>,
    next_id: AtomicUsize,
    pub task_checks: AtomicUsize,
    /// Extra latency of every `get_task`, standing in for a read stuck in
    /// retry backoff.
    pub task_read_delay: Mutex<Option<Duration>>,
    pub uploads: Mutex<Vec<(String, PathBuf)>>,
    pub deleted_streams: Mutex<Vec<String>>,
}

impl MockMediaApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_task(&self, task_id: &str, phases: &[TaskPhase]) {
        let script = phases.iter().map(|phase| (*phase, None)).collect();
        self.tasks.lock().unwrap().insert(task_id.to_string(), script);
    }

    pub fn fail_task(&self, task_id: &str, reason: &str) {
        self.tasks.lock().unwrap().insert(
            task_id.to_string(),
            VecDeque::from(vec![(TaskPhase::Failed, Some(reason.to_string()))]),
        );
    }

    pub fn add_asset(&self, asset_id: &str, playback_id: Option<&str>, duration: f64) {
        self.assets.lock().unwrap().insert(
            asset_id.to_string(),
            playable_asset(asset_id, playback_id, duration),
        );
    }

    pub fn add_playback(&self, playback_id: &str, sources: Vec<PlaybackSource>) {
        self.playback.lock().unwrap().insert(
            playback_id.to_string(),
            PlaybackInfo {
                kind: Some("vod".into()),
                meta: PlaybackMeta { source: sources },
            },
        );
    }

    pub fn add_hls_playback(&self, playback_id: &str) {
        self.add_playback(
            playback_id,
            vec![PlaybackSource {
                hrn: Some("HLS (TS)".into()),
                kind: HLS_SOURCE_TYPE.into(),
                url: format!("https://cdn.test/hls/{playback_id}/index.m3u8"),
            }],
        );
    }

    /// Asset plus a task that succeeds after one running check, playable via
    /// HLS. Returns the asset id.
    fn create_playable(&self, prefix: &str) -> (Asset, String) {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let asset_id = format!("{prefix}-asset-{n}");
        let task_id = format!("{prefix}-task-{n}");
        let playback_id = format!("{prefix}-pb-{n}");
        self.add_asset(&asset_id, Some(&playback_id), 120.0);
        self.add_hls_playback(&playback_id);
        if !self.tasks.lock().unwrap().contains_key(&task_id) {
            self.script_task(&task_id, &[TaskPhase::Running, TaskPhase::Succeeded]);
        }
        let asset = self.assets.lock().unwrap()[&asset_id].clone();
        (asset, task_id)
    }
}

pub fn playable_asset(asset_id: &str, playback_id: Option<&str>, duration: f64) -> Asset {
    Asset {
        id: asset_id.to_string(),
        name: None,
        playback_id: playback_id.map(str::to_string),
        video_spec: Some(VideoSpec {
            duration: Some(duration),
            format: Some("mp4".into()),
        }),
    }
}

#[async_trait]
impl MediaApi for MockMediaApi {
    fn server(&self) -> &str {
        "studio.test"
    }

    async fn get_asset(&self, asset_id: &str) -> TesterResult<Asset> {
        self.assets
            .lock()
            .unwrap()
            .get(asset_id)
            .cloned()
            .ok_or_else(|| TesterError::remote_failure(format!("asset {asset_id} not found")))
    }

    async fn import_asset(
        &self,
        _url: &str,
        _name: &str,
        _pipeline_strategy: Option<&str>,
    ) -> TesterResult<(Asset, Task)> {
        let (asset, task_id) = self.create_playable("import");
        Ok((asset, Task::pending(task_id)))
    }

    async fn request_upload(
        &self,
        _name: &str,
        _pipeline_strategy: Option<&str>,
    ) -> TesterResult<UploadRequest> {
        let (asset, task_id) = self.create_playable("upload");
        Ok(UploadRequest {
            url: format!("https://upload.test/direct/{}", asset.id),
            tus_endpoint: format!("https://upload.test/tus?asset={}", asset.id),
            asset,
            task: TaskRef { id: task_id },
        })
    }

    async fn upload_direct(&self, url: &str, file: &Path) -> TesterResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((url.to_string(), file.to_path_buf()));
        Ok(())
    }

    async fn upload_resumable(&self, tus_endpoint: &str, file: &Path) -> TesterResult<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((tus_endpoint.to_string(), file.to_path_buf()));
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> TesterResult<Task> {
        self.task_checks.fetch_add(1, Ordering::SeqCst);
        let delay = *self.task_read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut tasks = self.tasks.lock().unwrap();
        let script = tasks
            .get_mut(task_id)
            .ok_or_else(|| TesterError::remote_failure(format!("task {task_id} not found")))?;
        let (phase, reason) = if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        };
        let mut task = Task::pending(task_id);
        task.status.phase = phase;
        task.status.error_message = reason;
        Ok(task)
    }

    async fn export_asset(&self, asset_id: &str) -> TesterResult<Task> {
        let task_id = format!("export-{asset_id}");
        self.script_task(&task_id, &[TaskPhase::Succeeded]);
        Ok(Task::pending(task_id))
    }

    async fn transcode(&self, _request: &TranscodeRequest) -> TesterResult<Task> {
        Err(TesterError::remote_failure("transcode not scripted"))
    }

    async fn get_playback_info(&self, playback_id: &str) -> TesterResult<PlaybackInfo> {
        self.playback
            .lock()
            .unwrap()
            .get(playback_id)
            .cloned()
            .ok_or_else(|| TesterError::remote_failure(format!("playback {playback_id} not found")))
    }

    async fn list_ingests(&self) -> TesterResult<Vec<Ingest>> {
        Ok(vec![Ingest {
            ingest: "rtmp://ingest.test/live".into(),
            playback: "https://cdn.test/hls".into(),
        }])
    }

    async fn create_stream(&self, _request: &CreateStreamRequest) -> TesterResult<Stream> {
        Ok(Stream {
            id: "stream-1".into(),
            name: None,
            stream_key: "key-1".into(),
            playback_id: None,
        })
    }

    async fn delete_stream(&self, stream_id: &str) -> TesterResult<()> {
        self.deleted_streams.lock().unwrap().push(stream_id.to_string());
        Ok(())
    }

    async fn list_sessions(&self, _stream_id: &str) -> TesterResult<Vec<StreamSession>> {
        Ok(vec![StreamSession {
            id: "session-1".into(),
            record: true,
            recording_status: Some("ready".into()),
            recording_url: None,
            playback_id: Some("rec-pb".into()),
            source_duration: Some(60.0),
        }])
    }
}

/// Inspector returning scripted rendition counts, one per call; the last
/// entry repeats. `None` means the manifest is not available yet.
pub struct ScriptedInspector {
    script: Mutex<VecDeque<Option<usize>>>,
    pub calls: AtomicUsize,
    pub urls: Mutex<Vec<String>>,
}

impl ScriptedInspector {
    pub fn new(script: &[Option<usize>]) -> Self {
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        }
    }

    pub fn ready(renditions: usize) -> Self {
        Self::new(&[Some(renditions)])
    }
}

#[async_trait]
impl ManifestInspector for ScriptedInspector {
    async fn inspect(&self, url: &str) -> TesterResult<ManifestStats> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().copied().unwrap()
            }
        };
        match next {
            None => Err(TesterError::remote_failure(format!(
                "manifest {url} returned status 404 Not Found"
            ))),
            Some(count) => Ok(ManifestStats {
                renditions: (0..count)
                    .map(|i| RenditionStats {
                        uri: format!("{url}/{i}"),
                        bandwidth: Some(1_000_000 * (i as u64 + 1)),
                        segments: 12,
                        duration: 120.0,
                    })
                    .collect(),
            }),
        }
    }
}

/// Simulator that just waits out the stream duration.
pub struct IdleSimulator;

#[async_trait]
impl StreamSimulator for IdleSimulator {
    async fn stream(
        &self,
        _file: &Path,
        _ingest_url: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> TesterResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TesterError::cancelled()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Fixed membership list.
pub struct StaticNodes(pub Vec<GeoNode>);

#[async_trait]
impl NodeSource for StaticNodes {
    async fn members(&self, _cancel: &CancellationToken) -> TesterResult<Vec<GeoNode>> {
        Ok(self.0.clone())
    }
}

pub fn vod_config(file: &Path) -> TesterConfig {
    toml::from_str(&format!(
        r#"
        [api]
        server = "studio.test"
        access_token = "token"

        [vod]
        enabled = true
        file = "{}"

        [polling]
        task_poll_interval_seconds = 5
        manifest_poll_interval_seconds = 1
        "#,
        file.display()
    ))
    .unwrap()
}
