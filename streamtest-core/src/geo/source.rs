use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{TesterError, TesterResult};
use crate::retry::RetryPolicy;

use super::GeoNode;

/// Membership list of candidate playback nodes.
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn members(&self, cancel: &CancellationToken) -> TesterResult<Vec<GeoNode>>;
}

#[derive(Debug, Clone)]
pub struct FileNodeSource {
    path: PathBuf,
}

impl FileNodeSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NodeSource for FileNodeSource {
    async fn members(&self, _cancel: &CancellationToken) -> TesterResult<Vec<GeoNode>> {
        let data = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            TesterError::configuration(format!(
                "failed to read node list {}: {err}",
                self.path.display()
            ))
        })?;
        let members: Vec<GeoNode> = serde_json::from_str(&data).map_err(|err| {
            TesterError::configuration(format!(
                "failed to parse node list {}: {err}",
                self.path.display()
            ))
        })?;
        info!(path = %self.path.display(), members = members.len(), "loaded node list");
        Ok(members)
    }
}

#[derive(Debug, Clone)]
pub struct HttpNodeSource {
    client: Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpNodeSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch(&self) -> TesterResult<Vec<GeoNode>> {
        let response = self.client.get(&self.url).send().await.map_err(|err| {
            TesterError::transient(format!("error fetching node list from {}: {err}", self.url))
        })?;
        let status = response.status();
        if !status.is_success() {
            let err = format!("node list {} returned status {status}", self.url);
            return Err(if status.is_server_error() {
                TesterError::transient(err)
            } else {
                TesterError::remote_failure(err)
            });
        }
        response.json::<Vec<GeoNode>>().await.map_err(|err| {
            TesterError::remote_failure(format!("invalid node list from {}: {err}", self.url))
        })
    }
}

#[async_trait]
impl NodeSource for HttpNodeSource {
    async fn members(&self, cancel: &CancellationToken) -> TesterResult<Vec<GeoNode>> {
        let outcome = self
            .retry
            .run("node-members", cancel, |_| self.fetch())
            .await?;
        info!(
            url = %self.url,
            members = outcome.result.len(),
            attempts = outcome.attempts,
            "fetched node list"
        );
        Ok(outcome.result)
    }
}

/// Builds a source from the configured spec: an http(s) URL or a file path.
pub fn node_source_from_spec(client: Client, spec: &str) -> Arc<dyn NodeSource> {
    if spec.starts_with("http://") || spec.starts_with("https://") {
        Arc::new(HttpNodeSource::new(client, spec))
    } else {
        Arc::new(FileNodeSource::new(spec))
    }
}
