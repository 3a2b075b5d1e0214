use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::MediaApi;
use crate::config::PollingSection;
use crate::error::{TesterError, TesterResult};
use crate::retry::until_cancelled;
use crate::manifest::{ManifestInspector, ManifestStats};

/// Terminal check of every session: an artifact counts as playable once its
/// manifest is fetchable and lists more than the source rendition.
pub struct PlaybackVerifier {
    api: Arc<dyn MediaApi>,
    inspector: Arc<dyn ManifestInspector>,
    max_wait: Duration,
    poll_interval: Duration,
}

impl fmt::Debug for PlaybackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackVerifier")
            .field("max_wait", &self.max_wait)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl PlaybackVerifier {
    pub fn new(
        api: Arc<dyn MediaApi>,
        inspector: Arc<dyn ManifestInspector>,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            api,
            inspector,
            max_wait,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn from_config(
        api: Arc<dyn MediaApi>,
        inspector: Arc<dyn ManifestInspector>,
        polling: &PollingSection,
    ) -> Self {
        Self::new(
            api,
            inspector,
            polling.manifest_max_wait(),
            polling.manifest_poll_interval(),
        )
    }

    /// Verifies the asset `asset_id`. `expected_min_duration` of zero only
    /// requires a positive duration.
    pub async fn verify(
        &self,
        asset_id: &str,
        expected_min_duration: f64,
        cancel: &CancellationToken,
    ) -> TesterResult<ManifestStats> {
        self.verify_asset(asset_id, expected_min_duration, cancel)
            .await
            .map_err(|err| err.with_asset(asset_id))
    }

    async fn verify_asset(
        &self,
        asset_id: &str,
        expected_min_duration: f64,
        cancel: &CancellationToken,
    ) -> TesterResult<ManifestStats> {
        let asset = until_cancelled(cancel, self.api.get_asset(asset_id))
            .await
            .map_err(|err| err.wrap("error retrieving asset"))?;
        let duration = asset.duration_seconds();
        if duration <= 0.0 {
            return Err(TesterError::verification("no duration"));
        }
        if duration < expected_min_duration {
            return Err(TesterError::verification(format!(
                "duration {duration:.1}s shorter than expected {expected_min_duration:.1}s"
            )));
        }
        let playback_id = asset
            .playback_id
            .as_deref()
            .ok_or_else(|| TesterError::verification("asset has no playback id"))?;
        self.verify_playback_id(playback_id, cancel).await
    }

    /// Locates the HLS source of `playback_id` and waits for its manifest.
    pub async fn verify_playback_id(
        &self,
        playback_id: &str,
        cancel: &CancellationToken,
    ) -> TesterResult<ManifestStats> {
        let info = until_cancelled(cancel, self.api.get_playback_info(playback_id))
            .await
            .map_err(|err| err.wrap("error retrieving playback info"))?;
        let Some(url) = info.hls_url() else {
            return Err(TesterError::verification("no streaming source"));
        };
        info!(playback_id, manifest = %url, "found streaming source");
        self.wait_for_renditions(url, cancel).await
    }

    /// Polls `url` until it lists more than one rendition or `max_wait`
    /// passes. The first fetch is immediate.
    pub async fn wait_for_renditions(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> TesterResult<ManifestStats> {
        let started = Instant::now();
        let mut last_seen: Option<ManifestStats> = None;
        let mut last_error: Option<TesterError> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(TesterError::cancelled());
            }
            match self.inspector.inspect(url).await {
                Ok(stats) if stats.rendition_count() > 1 => {
                    info!(manifest = %url, renditions = stats.rendition_count(), "manifest verified");
                    return Ok(stats);
                }
                Ok(stats) => {
                    debug!(manifest = %url, renditions = stats.rendition_count(), "waiting for renditions");
                    last_seen = Some(stats);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    debug!(manifest = %url, error = %err, "manifest not available yet");
                    last_error = Some(err);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.max_wait {
                return Err(match (last_seen, last_error) {
                    (Some(stats), _) => TesterError::verification(format!(
                        "insufficient renditions: {} after {}s",
                        stats.rendition_count(),
                        elapsed.as_secs()
                    )),
                    (None, Some(err)) => {
                        TesterError::verification(format!("manifest not available: {}", err.message))
                    }
                    (None, None) => TesterError::verification("manifest not available"),
                });
            }
            let wait = self.poll_interval.min(self.max_wait - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(TesterError::cancelled()),
                _ = sleep(wait) => {}
            }
        }
    }
}
