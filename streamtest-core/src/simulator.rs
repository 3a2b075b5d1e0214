use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TesterError, TesterResult};

/// Pushes a looping file to an ingest endpoint for a fixed duration.
#[async_trait]
pub trait StreamSimulator: Send + Sync {
    async fn stream(
        &self,
        file: &Path,
        ingest_url: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> TesterResult<()>;
}

#[derive(Debug, Clone)]
pub struct FfmpegStreamSimulator {
    ffmpeg: PathBuf,
}

impl Default for FfmpegStreamSimulator {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

enum Ended {
    Cancelled,
    Elapsed,
    Exited(std::io::Result<ExitStatus>),
}

impl FfmpegStreamSimulator {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn args(file: &Path, ingest_url: &str) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-re".into(),
            "-stream_loop".into(),
            "-1".into(),
            "-i".into(),
            file.display().to_string(),
            "-c".into(),
            "copy".into(),
            "-f".into(),
            "flv".into(),
            ingest_url.to_string(),
        ]
    }
}

#[async_trait]
impl StreamSimulator for FfmpegStreamSimulator {
    async fn stream(
        &self,
        file: &Path,
        ingest_url: &str,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> TesterResult<()> {
        if !file.exists() {
            return Err(TesterError::configuration(format!(
                "stream file {} not found",
                file.display()
            )));
        }
        let mut command = Command::new(&self.ffmpeg);
        command
            .args(Self::args(file, ingest_url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        debug!(ffmpeg = %self.ffmpeg.display(), file = %file.display(), "starting stream");
        let mut child = command.spawn().map_err(|err| {
            TesterError::configuration(format!(
                "failed to start {}: {err}",
                self.ffmpeg.display()
            ))
        })?;

        let ended = tokio::select! {
            _ = cancel.cancelled() => Ended::Cancelled,
            _ = sleep(duration) => Ended::Elapsed,
            status = child.wait() => Ended::Exited(status),
        };
        match ended {
            Ended::Exited(Ok(status)) => Err(TesterError::remote_failure(format!(
                "ffmpeg exited before the stream duration elapsed: {status}"
            ))),
            Ended::Exited(Err(err)) => Err(TesterError::internal(format!(
                "failed waiting for ffmpeg: {err}"
            ))),
            Ended::Cancelled => {
                stop(&mut child).await;
                Err(TesterError::cancelled())
            }
            Ended::Elapsed => {
                stop(&mut child).await;
                info!(seconds = duration.as_secs(), "stream finished");
                Ok(())
            }
        }
    }
}

async fn stop(child: &mut tokio::process::Child) {
    if let Err(err) = child.kill().await {
        warn!(error = %err, "failed to stop ffmpeg");
    }
}
