use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::TranscodeRequest;
use crate::error::{TesterError, TesterResult};

use super::{Phase, SessionContext};

/// Transcodes a remote input into the configured bucket and checks that the
/// produced manifest carries several renditions.
#[derive(Debug)]
pub struct TranscodePhase {
    ctx: SessionContext,
}

impl TranscodePhase {
    pub const NAME: &'static str = "transcode";

    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    fn request(&self) -> TesterResult<TranscodeRequest> {
        let section = &self.ctx.config.transcode;
        let input_url = section
            .input_url
            .clone()
            .ok_or_else(|| TesterError::configuration("transcode.input_url should be specified"))?;
        let storage_url = section
            .bucket_url
            .clone()
            .ok_or_else(|| TesterError::configuration("transcode.bucket_url should be specified"))?;
        Ok(TranscodeRequest {
            input_url,
            storage_url,
            output_path: format!(
                "/streamtest/{}/{}",
                self.ctx.host_label(),
                Utc::now().format("%Y%m%dT%H%M%S")
            ),
            w3s_proof: section.w3s_proof.clone(),
            pipeline_strategy: self.ctx.pipeline_strategy().map(str::to_string),
        })
    }
}

#[async_trait]
impl Phase for TranscodePhase {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn deadline(&self) -> Option<Duration> {
        self.ctx.config.polling.phase_deadline()
    }

    async fn run(&self, cancel: CancellationToken) -> TesterResult<()> {
        let request = self.request()?;
        let task = self
            .ctx
            .api
            .transcode(&request)
            .await
            .map_err(|err| err.wrap("error starting transcode"))?;
        info!(task_id = %task.id, output = %request.output_path, "transcode started");
        let finished = self
            .ctx
            .poller
            .poll(self.ctx.api.as_ref(), &task.id, &cancel)
            .await?;
        let manifest = finished.output_manifest_url().ok_or_else(|| {
            TesterError::verification("transcode task reported no manifest").with_task(&task.id)
        })?;
        self.ctx
            .verifier
            .wait_for_renditions(&manifest, &cancel)
            .await
            .map_err(|err| err.with_task(&task.id))?;
        Ok(())
    }
}
