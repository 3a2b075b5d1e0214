//! Hosted media API seam: the data the orchestrator reads and the calls it
//! makes. `HttpMediaApi` is the production implementation.

mod error;
mod http;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TesterResult;

pub use error::ApiError;
pub use http::HttpMediaApi;

/// Source type the playback description uses for HLS manifests.
pub const HLS_SOURCE_TYPE: &str = "html5/application/vnd.apple.mpegurl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    #[serde(alias = "waiting")]
    Pending,
    Running,
    #[serde(alias = "completed")]
    Succeeded,
    #[serde(alias = "cancelled")]
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Succeeded | TaskPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub phase: TaskPhase,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub output_asset_id: Option<String>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
}

impl Task {
    /// Task as known right after creation, before its first status fetch.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            status: TaskStatus {
                phase: TaskPhase::Pending,
                progress: None,
                error_message: None,
            },
            output_asset_id: None,
            output: None,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.status.phase
    }

    /// Walks `output` for the first string found under a `manifestUrl` key.
    pub fn output_manifest_url(&self) -> Option<String> {
        fn find(value: &serde_json::Value) -> Option<String> {
            match value {
                serde_json::Value::Object(map) => {
                    if let Some(serde_json::Value::String(url)) = map.get("manifestUrl") {
                        return Some(url.clone());
                    }
                    map.values().find_map(find)
                }
                serde_json::Value::Array(items) => items.iter().find_map(find),
                _ => None,
            }
        }
        self.output.as_ref().and_then(find)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSpec {
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub playback_id: Option<String>,
    #[serde(default)]
    pub video_spec: Option<VideoSpec>,
}

impl Asset {
    pub fn duration_seconds(&self) -> f64 {
        self.video_spec
            .as_ref()
            .and_then(|spec| spec.duration)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub url: String,
    pub tus_endpoint: String,
    pub asset: Asset,
    pub task: TaskRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSource {
    #[serde(default)]
    pub hrn: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackMeta {
    #[serde(default)]
    pub source: Vec<PlaybackSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackInfo {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub meta: PlaybackMeta,
}

impl PlaybackInfo {
    pub fn hls_url(&self) -> Option<&str> {
        self.meta
            .source
            .iter()
            .find(|source| source.kind == HLS_SOURCE_TYPE)
            .map(|source| source.url.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeRequest {
    pub input_url: String,
    pub storage_url: String,
    pub output_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w3s_proof: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStreamRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presets: Vec<String>,
    pub record: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_object_store_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub stream_key: String,
    #[serde(default)]
    pub playback_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub id: String,
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub recording_status: Option<String>,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub playback_id: Option<String>,
    #[serde(default)]
    pub source_duration: Option<f64>,
}

impl StreamSession {
    pub fn recording_ready(&self) -> bool {
        self.recording_status.as_deref() == Some("ready")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingest {
    pub ingest: String,
    pub playback: String,
}

/// Calls the orchestrator makes against the hosted media API.
///
/// Uploads are uninterruptible: once started they run to completion even if
/// the owning lifetime is cancelled meanwhile.
#[async_trait]
pub trait MediaApi: Send + Sync {
    fn server(&self) -> &str;

    async fn get_asset(&self, asset_id: &str) -> TesterResult<Asset>;

    async fn import_asset(
        &self,
        url: &str,
        name: &str,
        pipeline_strategy: Option<&str>,
    ) -> TesterResult<(Asset, Task)>;

    async fn request_upload(
        &self,
        name: &str,
        pipeline_strategy: Option<&str>,
    ) -> TesterResult<UploadRequest>;

    async fn upload_direct(&self, url: &str, file: &Path) -> TesterResult<()>;

    async fn upload_resumable(&self, tus_endpoint: &str, file: &Path) -> TesterResult<()>;

    async fn get_task(&self, task_id: &str) -> TesterResult<Task>;

    async fn export_asset(&self, asset_id: &str) -> TesterResult<Task>;

    async fn transcode(&self, request: &TranscodeRequest) -> TesterResult<Task>;

    async fn get_playback_info(&self, playback_id: &str) -> TesterResult<PlaybackInfo>;

    async fn list_ingests(&self) -> TesterResult<Vec<Ingest>>;

    async fn create_stream(&self, request: &CreateStreamRequest) -> TesterResult<Stream>;

    async fn delete_stream(&self, stream_id: &str) -> TesterResult<()>;

    async fn list_sessions(&self, stream_id: &str) -> TesterResult<Vec<StreamSession>>;
}

/// Points `target` at the host of `source`, unless the target host already
/// contains it (a regional endpoint under the same global domain).
pub fn patch_url_host(target: &str, source: &str) -> String {
    let Ok(mut target_url) = url::Url::parse(target) else {
        return target.to_string();
    };
    let source_url = match url::Url::parse(source) {
        Ok(url) => url,
        Err(_) => match url::Url::parse(&format!("https://{source}")) {
            Ok(url) => url,
            Err(_) => return target.to_string(),
        },
    };
    let (Some(target_host), Some(source_host)) = (target_url.host_str(), source_url.host_str())
    else {
        return target.to_string();
    };
    if target_host.contains(source_host) {
        return target.to_string();
    }
    let source_host = source_host.to_string();
    if target_url.set_scheme(source_url.scheme()).is_err()
        || target_url.set_host(Some(&source_host)).is_err()
    {
        return target.to_string();
    }
    // Url::set_host keeps the old port; the source's port wins.
    if target_url.set_port(source_url.port()).is_err() {
        return target.to_string();
    }
    target_url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_phase_accepts_remote_aliases() {
        let task: Task = serde_json::from_str(
            r#"{"id":"t1","type":"import","status":{"phase":"completed","progress":1.0}}"#,
        )
        .unwrap();
        assert_eq!(task.phase(), TaskPhase::Succeeded);
        let waiting: TaskStatus = serde_json::from_str(r#"{"phase":"waiting"}"#).unwrap();
        assert_eq!(waiting.phase, TaskPhase::Pending);
        assert!(!waiting.phase.is_terminal());
        let failed: TaskStatus =
            serde_json::from_str(r#"{"phase":"failed","errorMessage":"bad codec"}"#).unwrap();
        assert!(failed.phase.is_terminal());
        assert_eq!(failed.error_message.as_deref(), Some("bad codec"));
    }

    #[test]
    fn playback_info_finds_hls_source() {
        let info: PlaybackInfo = serde_json::from_str(
            r#"{"type":"vod","meta":{"source":[
                {"hrn":"MP4","type":"html5/video/mp4","url":"https://cdn/x.mp4"},
                {"hrn":"HLS (TS)","type":"html5/application/vnd.apple.mpegurl","url":"https://cdn/x/index.m3u8"}
            ]}}"#,
        )
        .unwrap();
        assert_eq!(info.hls_url(), Some("https://cdn/x/index.m3u8"));
        let empty = PlaybackInfo {
            kind: None,
            meta: PlaybackMeta::default(),
        };
        assert!(empty.hls_url().is_none());
    }

    #[test]
    fn output_manifest_url_is_found_in_nested_output() {
        let mut task = Task::pending("t2");
        task.output = Some(serde_json::json!({
            "transcodeFile": {"hls": {"path": "/out"}, "manifestUrl": "https://bucket/out/index.m3u8"}
        }));
        assert_eq!(
            task.output_manifest_url().as_deref(),
            Some("https://bucket/out/index.m3u8")
        );
    }

    #[test]
    fn patch_url_host_rewrites_foreign_hosts_only() {
        assert_eq!(
            patch_url_host("https://origin.livepeer.studio/api/upload/tus?token=x", "livepeer.studio"),
            "https://origin.livepeer.studio/api/upload/tus?token=x"
        );
        assert_eq!(
            patch_url_host("https://storage.example.com/tus/abc", "http://localhost:3004"),
            "http://localhost:3004/tus/abc"
        );
        assert_eq!(patch_url_host("not a url", "livepeer.studio"), "not a url");
    }
}
