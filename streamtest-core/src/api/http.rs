use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ApiSection;
use crate::error::{TesterError, TesterResult};
use crate::retry::RetryPolicy;

use super::error::{ApiError, ApiResult};
use super::{
    Asset, CreateStreamRequest, Ingest, MediaApi, PlaybackInfo, Stream, StreamSession, Task,
    TaskRef, TranscodeRequest, UploadRequest,
};

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const TUS_VERSION: &str = "1.0.0";
const TUS_CHUNK_SIZE: usize = 8 * 1024 * 1024;
const MAX_ERROR_BODY_CHARS: usize = 512;

/// `MediaApi` over the hosted platform's REST endpoints.
///
/// Reads go through the retry policy; mutating calls are sent once.
#[derive(Clone)]
pub struct HttpMediaApi {
    client: Client,
    server: String,
    base_url: String,
    token: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl fmt::Debug for HttpMediaApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMediaApi")
            .field("server", &self.server)
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportBody<'a> {
    url: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline_strategy: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestUploadBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline_strategy: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct AssetWithTask {
    asset: Asset,
    task: TaskRef,
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    task: TaskRef,
}

impl HttpMediaApi {
    pub fn new(
        server: impl Into<String>,
        token: impl Into<String>,
        request_timeout: Duration,
    ) -> ApiResult<Self> {
        let server = server.into();
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: base_url_for(&server),
            server,
            client,
            token: token.into(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn from_config(config: &ApiSection) -> TesterResult<Self> {
        let token = config
            .access_token
            .clone()
            .ok_or_else(|| TesterError::configuration("api.access_token should be specified"))?;
        Ok(Self::new(&config.server, token, config.request_timeout())?)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Process-wide stop for read retries. Phases bound their own reads with
    /// `retry::until_cancelled`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: &'static str,
        url: &str,
        request: RequestBuilder,
    ) -> ApiResult<T> {
        let response = request.bearer_auth(&self.token).send().await?;
        let response = check_status(method, url, response).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_json<T>(&self, operation: &str, path: &str) -> TesterResult<T>
    where
        T: DeserializeOwned + Send,
    {
        let url = self.endpoint(path);
        let outcome = self
            .retry
            .run(operation, &self.cancel, |_| {
                let url = url.clone();
                async move {
                    self.send_json::<T>("GET", &url, self.client.get(&url))
                        .await
                        .map_err(TesterError::from)
                }
            })
            .await?;
        if outcome.attempts > 1 {
            debug!(operation, attempts = outcome.attempts, "read succeeded after retry");
        }
        Ok(outcome.result)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> TesterResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint(path);
        let request = self.client.post(&url).json(body);
        Ok(self.send_json("POST", &url, request).await?)
    }

    async fn tus_upload(&self, endpoint: &str, file: &Path) -> ApiResult<u64> {
        let io_error = |source: std::io::Error| ApiError::Io {
            source,
            path: file.to_path_buf(),
        };
        let mut handle = tokio::fs::File::open(file).await.map_err(io_error)?;
        let size = handle.metadata().await.map_err(io_error)?.len();

        let created = self
            .client
            .post(endpoint)
            .header("Tus-Resumable", TUS_VERSION)
            .header("Upload-Length", size.to_string())
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;
        let created = check_status("POST", endpoint, created).await?;
        let location = created
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ApiError::UnexpectedResponse("tus create response without Location".into())
            })?;
        let upload_url = resolve_location(endpoint, location)?;

        let mut offset = 0u64;
        let mut buffer = vec![0u8; TUS_CHUNK_SIZE];
        while offset < size {
            let read = read_chunk(&mut handle, &mut buffer)
                .await
                .map_err(io_error)?;
            if read == 0 {
                return Err(ApiError::UnexpectedResponse(format!(
                    "file ended at {offset} of {size} bytes"
                )));
            }
            let response = self
                .client
                .patch(&upload_url)
                .header("Tus-Resumable", TUS_VERSION)
                .header("Upload-Offset", offset.to_string())
                .header(CONTENT_TYPE, "application/offset+octet-stream")
                .timeout(UPLOAD_TIMEOUT)
                .body(buffer[..read].to_vec())
                .send()
                .await?;
            let response = check_status("PATCH", &upload_url, response).await?;
            let expected = offset + read as u64;
            let acknowledged = response
                .headers()
                .get("Upload-Offset")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(expected);
            if acknowledged != expected {
                return Err(ApiError::UnexpectedResponse(format!(
                    "server acknowledged offset {acknowledged}, expected {expected}"
                )));
            }
            offset = acknowledged;
        }
        Ok(size)
    }
}

#[async_trait]
impl MediaApi for HttpMediaApi {
    fn server(&self) -> &str {
        &self.server
    }

    async fn get_asset(&self, asset_id: &str) -> TesterResult<Asset> {
        self.get_json("get-asset", &format!("/asset/{asset_id}"))
            .await
            .map_err(|err| err.with_asset(asset_id))
    }

    async fn import_asset(
        &self,
        url: &str,
        name: &str,
        pipeline_strategy: Option<&str>,
    ) -> TesterResult<(Asset, Task)> {
        let body = ImportBody {
            url,
            name,
            pipeline_strategy,
        };
        let created: AssetWithTask = self.post_json("/asset/upload/url", &body).await?;
        info!(asset_id = %created.asset.id, task_id = %created.task.id, "imported asset from url");
        Ok((created.asset, Task::pending(created.task.id)))
    }

    async fn request_upload(
        &self,
        name: &str,
        pipeline_strategy: Option<&str>,
    ) -> TesterResult<UploadRequest> {
        let body = RequestUploadBody {
            name,
            pipeline_strategy,
        };
        self.post_json("/asset/request-upload", &body).await
    }

    async fn upload_direct(&self, url: &str, file: &Path) -> TesterResult<()> {
        let io_error = |source: std::io::Error| ApiError::Io {
            source,
            path: file.to_path_buf(),
        };
        let handle = tokio::fs::File::open(file).await.map_err(io_error)?;
        let size = handle.metadata().await.map_err(io_error)?.len();
        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .timeout(UPLOAD_TIMEOUT)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(handle)))
            .send()
            .await
            .map_err(ApiError::from)?;
        check_status("PUT", url, response).await?;
        info!(file = %file.display(), bytes = size, "direct upload finished");
        Ok(())
    }

    async fn upload_resumable(&self, tus_endpoint: &str, file: &Path) -> TesterResult<()> {
        let bytes = self.tus_upload(tus_endpoint, file).await?;
        info!(file = %file.display(), bytes, "resumable upload finished");
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> TesterResult<Task> {
        self.get_json("get-task", &format!("/task/{task_id}"))
            .await
            .map_err(|err| err.with_task(task_id))
    }

    async fn export_asset(&self, asset_id: &str) -> TesterResult<Task> {
        let envelope: TaskEnvelope = self
            .post_json(&format!("/asset/{asset_id}/export"), &json!({ "ipfs": {} }))
            .await
            .map_err(|err| err.with_asset(asset_id))?;
        Ok(Task::pending(envelope.task.id))
    }

    async fn transcode(&self, request: &TranscodeRequest) -> TesterResult<Task> {
        let storage = match &request.w3s_proof {
            Some(proof) => json!({ "type": "web3.storage", "credentials": { "proof": proof } }),
            None => json!({ "url": request.storage_url }),
        };
        let mut body = json!({
            "input": { "url": request.input_url },
            "storage": storage,
            "outputs": { "hls": { "path": request.output_path } },
        });
        if let Some(strategy) = &request.pipeline_strategy {
            body["pipelineStrategy"] = json!(strategy);
        }
        self.post_json("/transcode", &body).await
    }

    async fn get_playback_info(&self, playback_id: &str) -> TesterResult<PlaybackInfo> {
        self.get_json("get-playback-info", &format!("/playback/{playback_id}"))
            .await
    }

    async fn list_ingests(&self) -> TesterResult<Vec<Ingest>> {
        self.get_json("list-ingests", "/ingest").await
    }

    async fn create_stream(&self, request: &CreateStreamRequest) -> TesterResult<Stream> {
        let stream: Stream = self.post_json("/stream", request).await?;
        info!(stream_id = %stream.id, name = %request.name, "created stream");
        Ok(stream)
    }

    async fn delete_stream(&self, stream_id: &str) -> TesterResult<()> {
        let url = self.endpoint(&format!("/stream/{stream_id}"));
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(ApiError::from)?;
        check_status("DELETE", &url, response).await?;
        Ok(())
    }

    async fn list_sessions(&self, stream_id: &str) -> TesterResult<Vec<StreamSession>> {
        self.get_json("list-sessions", &format!("/stream/{stream_id}/sessions"))
            .await
    }
}

fn base_url_for(server: &str) -> String {
    let server = server.trim().trim_end_matches('/');
    if server.starts_with("http://") || server.starts_with("https://") {
        server.to_string()
    } else {
        format!("https://{server}")
    }
}

fn resolve_location(endpoint: &str, location: &str) -> ApiResult<String> {
    let base = url::Url::parse(endpoint).map_err(|err| ApiError::InvalidUrl {
        url: endpoint.to_string(),
        reason: err.to_string(),
    })?;
    base.join(location)
        .map(|url| url.to_string())
        .map_err(|err| ApiError::InvalidUrl {
            url: location.to_string(),
            reason: err.to_string(),
        })
}

async fn check_status(method: &'static str, url: &str, response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        method,
        url: url.to_string(),
        status: status.as_u16(),
        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
    })
}

async fn read_chunk(file: &mut tokio::fs::File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = file.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
