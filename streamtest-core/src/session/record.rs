use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{patch_url_host, CreateStreamRequest, Stream, StreamSession};
use crate::error::{TesterError, TesterResult};
use crate::retry::until_cancelled;

use super::{Phase, SessionContext};

/// Streams a file into a recorded stream, waits for the recording and checks
/// its playback. The stream is deleted afterwards whatever the outcome.
#[derive(Debug)]
pub struct LiveRecordPhase {
    ctx: SessionContext,
}

impl LiveRecordPhase {
    pub const NAME: &'static str = "live-record";

    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Configured ingest, else the nearest pulled node, else the first
    /// ingest the API advertises.
    async fn ingest_base(&self, cancel: &CancellationToken) -> TesterResult<String> {
        if let Some(url) = &self.ctx.config.live.ingest_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        if let Some(node) = self.ctx.geo.as_ref().and_then(|plan| plan.pull.first()) {
            debug!(node = %node.name, addr = %node.addr, "ingesting through selected node");
            return Ok(format!("rtmp://{}/live", node.addr));
        }
        let ingests = until_cancelled(cancel, self.ctx.api.list_ingests())
            .await
            .map_err(|err| err.wrap("error listing ingests"))?;
        ingests
            .into_iter()
            .next()
            .map(|ingest| ingest.ingest.trim_end_matches('/').to_string())
            .ok_or_else(|| TesterError::remote_failure("no ingest endpoints advertised"))
    }

    async fn wait_for_recording(
        &self,
        stream: &Stream,
        cancel: &CancellationToken,
    ) -> TesterResult<StreamSession> {
        let limit = self.ctx.config.live.recording_wait();
        let interval = self.ctx.poller.interval();
        let started = Instant::now();
        loop {
            let sessions = until_cancelled(cancel, self.ctx.api.list_sessions(&stream.id))
                .await
                .map_err(|err| err.wrap("error listing sessions"))?;
            if let Some(session) = sessions.into_iter().find(StreamSession::recording_ready) {
                return Ok(session);
            }
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(TesterError::deadline_exceeded(format!(
                    "recording of stream {} not ready after {}s",
                    stream.id,
                    elapsed.as_secs()
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TesterError::cancelled()),
                _ = sleep(interval.min(limit - elapsed)) => {}
            }
        }
    }

    async fn exercise(&self, stream: &Stream, cancel: &CancellationToken) -> TesterResult<()> {
        let live = &self.ctx.config.live;
        let file = live
            .file
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| TesterError::configuration("live.file should be specified"))?;
        let ingest = format!("{}/{}", self.ingest_base(cancel).await?, stream.stream_key);
        info!(stream_id = %stream.id, seconds = live.stream_duration_seconds, "streaming");
        self.ctx
            .simulator
            .stream(&file, &ingest, live.stream_duration(), cancel)
            .await?;

        let session = self.wait_for_recording(stream, cancel).await?;
        if session.source_duration.unwrap_or(0.0) <= 0.0 {
            return Err(TesterError::verification("no duration"));
        }
        let playback_id = session
            .playback_id
            .as_deref()
            .ok_or_else(|| TesterError::verification("recorded session has no playback id"))?;
        info!(session_id = %session.id, playback_id, "recording ready");
        self.ctx
            .verifier
            .verify_playback_id(playback_id, cancel)
            .await?;
        self.verify_through_nodes(playback_id, cancel).await
    }

    /// Pulls the recording's manifest through every selected playback node.
    async fn verify_through_nodes(
        &self,
        playback_id: &str,
        cancel: &CancellationToken,
    ) -> TesterResult<()> {
        let Some(plan) = self.ctx.geo.as_ref().filter(|plan| !plan.pull.is_empty()) else {
            return Ok(());
        };
        let info = until_cancelled(cancel, self.ctx.api.get_playback_info(playback_id))
            .await
            .map_err(|err| err.wrap("error retrieving playback info"))?;
        let url = info
            .hls_url()
            .ok_or_else(|| TesterError::verification("no streaming source"))?;
        for node in &plan.pull {
            let node_url = patch_url_host(url, &format!("https://{}", node.addr));
            debug!(node = %node.name, manifest = %node_url, "pulling through node");
            self.ctx
                .verifier
                .wait_for_renditions(&node_url, cancel)
                .await
                .map_err(|err| err.wrap(format!("playback via {}", node.name)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Phase for LiveRecordPhase {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn deadline(&self) -> Option<Duration> {
        self.ctx.config.polling.phase_deadline()
    }

    async fn run(&self, cancel: CancellationToken) -> TesterResult<()> {
        let live = &self.ctx.config.live;
        let request = CreateStreamRequest {
            name: self.ctx.resource_name("record_test"),
            presets: live.profiles.clone(),
            record: true,
            record_object_store_id: live.record_object_store_id.clone(),
        };
        let stream = self
            .ctx
            .api
            .create_stream(&request)
            .await
            .map_err(|err| err.wrap("error creating stream"))?;

        let result = self.exercise(&stream, &cancel).await;
        if let Err(err) = self.ctx.api.delete_stream(&stream.id).await {
            warn!(stream_id = %stream.id, error = %err, "failed to delete stream");
        }
        result.map_err(|err| err.with_asset(&stream.id))
    }
}
