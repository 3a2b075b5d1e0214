use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{patch_url_host, Asset};
use crate::error::{TesterError, TesterResult};

use super::{Phase, SessionContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VodPhaseKind {
    UrlImport,
    DirectUpload,
    ResumableUpload,
}

impl VodPhaseKind {
    pub fn name(self) -> &'static str {
        match self {
            VodPhaseKind::UrlImport => "url-import",
            VodPhaseKind::DirectUpload => "direct-upload",
            VodPhaseKind::ResumableUpload => "resumable-upload",
        }
    }

    fn asset_prefix(self) -> &'static str {
        match self {
            VodPhaseKind::UrlImport => "vod_test_upload_url",
            VodPhaseKind::DirectUpload => "vod_test_upload_direct",
            VodPhaseKind::ResumableUpload => "vod_test_upload_resumable",
        }
    }
}

/// Creates an asset by import or upload, waits for processing and checks
/// playback. The url import additionally exports the asset when enabled.
#[derive(Debug)]
pub struct VodPhase {
    kind: VodPhaseKind,
    ctx: SessionContext,
}

impl VodPhase {
    pub fn new(kind: VodPhaseKind, ctx: SessionContext) -> Self {
        Self { kind, ctx }
    }

    pub fn kind(&self) -> VodPhaseKind {
        self.kind
    }

    fn file(&self) -> TesterResult<PathBuf> {
        self.ctx
            .config
            .vod
            .file
            .as_ref()
            .map(PathBuf::from)
            .ok_or_else(|| TesterError::configuration("vod.file is required for uploads"))
    }

    async fn create_asset(&self, name: &str, cancel: &CancellationToken) -> TesterResult<Asset> {
        let api = &self.ctx.api;
        let strategy = self.ctx.pipeline_strategy();
        let (asset, task_id) = match self.kind {
            VodPhaseKind::UrlImport => {
                let url = &self.ctx.config.vod.import_url;
                let (asset, task) = api
                    .import_asset(url, name, strategy)
                    .await
                    .map_err(|err| err.wrap("error importing asset"))?;
                (asset, task.id)
            }
            VodPhaseKind::DirectUpload => {
                let file = self.file()?;
                let request = api
                    .request_upload(name, strategy)
                    .await
                    .map_err(|err| err.wrap("error requesting upload"))?;
                api.upload_direct(&request.url, &file)
                    .await
                    .map_err(|err| {
                        err.wrap("error uploading file")
                            .with_asset(&request.asset.id)
                            .with_task(&request.task.id)
                    })?;
                (request.asset, request.task.id)
            }
            VodPhaseKind::ResumableUpload => {
                let file = self.file()?;
                let request = api
                    .request_upload(name, strategy)
                    .await
                    .map_err(|err| err.wrap("error requesting upload"))?;
                let tus_endpoint = patch_url_host(&request.tus_endpoint, api.server());
                api.upload_resumable(&tus_endpoint, &file)
                    .await
                    .map_err(|err| {
                        err.wrap("error uploading file")
                            .with_asset(&request.asset.id)
                            .with_task(&request.task.id)
                    })?;
                (request.asset, request.task.id)
            }
        };
        info!(phase = self.kind.name(), asset_id = %asset.id, task_id = %task_id, "asset created");

        self.ctx
            .poller
            .poll(api.as_ref(), &task_id, cancel)
            .await
            .map_err(|err| err.with_asset(&asset.id))?;
        Ok(asset)
    }

    async fn export(&self, asset_id: &str, cancel: &CancellationToken) -> TesterResult<()> {
        let task = self
            .ctx
            .api
            .export_asset(asset_id)
            .await
            .map_err(|err| err.wrap("error exporting asset").with_asset(asset_id))?;
        self.ctx
            .poller
            .poll(self.ctx.api.as_ref(), &task.id, cancel)
            .await
            .map_err(|err| err.wrap("export").with_asset(asset_id))?;
        info!(asset_id, task_id = %task.id, "asset exported");
        Ok(())
    }
}

#[async_trait]
impl Phase for VodPhase {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn deadline(&self) -> Option<Duration> {
        self.ctx.config.polling.phase_deadline()
    }

    async fn run(&self, cancel: CancellationToken) -> TesterResult<()> {
        let name = self.ctx.resource_name(self.kind.asset_prefix());
        let asset = self.create_asset(&name, &cancel).await?;
        self.ctx
            .verifier
            .verify(&asset.id, 0.0, &cancel)
            .await?;
        if self.kind == VodPhaseKind::UrlImport && self.ctx.config.vod.export {
            self.export(&asset.id, &cancel).await?;
        }
        Ok(())
    }
}
