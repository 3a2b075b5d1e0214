use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

const DEFAULT_IMPORT_URL: &str =
    "https://storage.googleapis.com/lp_testharness_assets/bbb_sunflower_1080p_30fps_normal_2min.mp4";
const MAX_PAUSE_SECONDS: u64 = 5 * 60;
const REDACTED: &str = "<redacted>";

/// Whether the tester runs one pass or loops until its duration expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Single,
    Continuous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TesterConfig {
    pub api: ApiSection,
    #[serde(default)]
    pub vod: VodSection,
    #[serde(default)]
    pub transcode: TranscodeSection,
    #[serde(default)]
    pub live: LiveSection,
    #[serde(default)]
    pub polling: PollingSection,
    #[serde(default)]
    pub continuous: ContinuousSection,
    #[serde(default)]
    pub geo: GeoSection,
    #[serde(default)]
    pub alerts: AlertsSection,
    #[serde(default)]
    pub metrics: MetricsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    pub server: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub catalyst_pipeline_strategy: Option<String>,
}

impl ApiSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VodSection {
    pub enabled: bool,
    pub file: Option<String>,
    pub import_url: String,
    pub url_import: bool,
    pub direct_upload: bool,
    pub resumable_upload: bool,
    pub export: bool,
}

impl Default for VodSection {
    fn default() -> Self {
        Self {
            enabled: false,
            file: None,
            import_url: DEFAULT_IMPORT_URL.to_string(),
            url_import: true,
            direct_upload: true,
            resumable_upload: true,
            export: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeSection {
    pub enabled: bool,
    pub input_url: Option<String>,
    pub bucket_url: Option<String>,
    pub w3s_proof: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSection {
    pub enabled: bool,
    pub file: Option<String>,
    pub stream_duration_seconds: u64,
    pub ingest_url: Option<String>,
    pub record_object_store_id: Option<String>,
    pub profiles: Vec<String>,
    pub recording_wait_seconds: u64,
}

impl LiveSection {
    pub fn stream_duration(&self) -> Duration {
        Duration::from_secs(self.stream_duration_seconds)
    }

    pub fn recording_wait(&self) -> Duration {
        Duration::from_secs(self.recording_wait_seconds)
    }
}

impl Default for LiveSection {
    fn default() -> Self {
        Self {
            enabled: false,
            file: None,
            stream_duration_seconds: 60,
            ingest_url: None,
            record_object_store_id: None,
            profiles: Vec::new(),
            recording_wait_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSection {
    pub task_poll_interval_seconds: u64,
    pub task_deadline_seconds: u64,
    pub manifest_max_wait_seconds: u64,
    pub manifest_poll_interval_seconds: u64,
    pub phase_deadline_seconds: Option<u64>,
}

impl PollingSection {
    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_secs(self.task_poll_interval_seconds)
    }

    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_seconds)
    }

    pub fn manifest_max_wait(&self) -> Duration {
        Duration::from_secs(self.manifest_max_wait_seconds)
    }

    pub fn manifest_poll_interval(&self) -> Duration {
        Duration::from_secs(self.manifest_poll_interval_seconds)
    }

    pub fn phase_deadline(&self) -> Option<Duration> {
        self.phase_deadline_seconds.map(Duration::from_secs)
    }
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            task_poll_interval_seconds: 15,
            task_deadline_seconds: 30 * 60,
            manifest_max_wait_seconds: 20,
            manifest_poll_interval_seconds: 2,
            phase_deadline_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuousSection {
    pub enabled: bool,
    pub total_duration_seconds: Option<u64>,
    pub pause_seconds: u64,
    pub cycle_timeout_seconds: Option<u64>,
    pub history_capacity: usize,
    pub alert_send_timeout_seconds: u64,
}

impl ContinuousSection {
    pub fn total_duration(&self) -> Option<Duration> {
        self.total_duration_seconds.map(Duration::from_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_seconds)
    }

    pub fn cycle_timeout(&self) -> Option<Duration> {
        self.cycle_timeout_seconds.map(Duration::from_secs)
    }

    pub fn alert_send_timeout(&self) -> Duration {
        Duration::from_secs(self.alert_send_timeout_seconds)
    }
}

impl Default for ContinuousSection {
    fn default() -> Self {
        Self {
            enabled: false,
            total_duration_seconds: None,
            pause_seconds: 0,
            cycle_timeout_seconds: None,
            history_capacity: 100,
            alert_send_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSection {
    pub enabled: bool,
    /// JSON file path or http(s) URL listing candidate nodes.
    pub node_source: Option<String>,
    pub pull_count: usize,
    pub node_count: usize,
    pub random_member: bool,
    pub latitude: f64,
    pub longitude: f64,
}

impl Default for GeoSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node_source: None,
            pull_count: 1,
            node_count: 5,
            random_member: false,
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsSection {
    pub discord: Option<DiscordSection>,
    pub pagerduty: Option<PagerDutySection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordSection {
    pub webhook_url: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub users_to_notify: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagerDutySection {
    pub integration_key: String,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub low_urgency: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub bind: String,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:9090".to_string(),
        }
    }
}

impl TesterConfig {
    /// Checks everything that must hold before the first cycle starts.
    pub fn validate(&self, mode: RunMode) -> Result<()> {
        if self.api.server.trim().is_empty() {
            return Err(ConfigError::invalid("api.server", "must not be empty"));
        }
        if self
            .api
            .access_token
            .as_deref()
            .map_or(true, |token| token.trim().is_empty())
        {
            return Err(ConfigError::invalid("api.access_token", "should be specified"));
        }
        if !self.vod.enabled && !self.transcode.enabled && !self.live.enabled {
            return Err(ConfigError::invalid(
                "workflows",
                "enable at least one of vod, transcode or live",
            ));
        }
        if self.vod.enabled {
            let needs_file = self.vod.direct_upload || self.vod.resumable_upload;
            if needs_file && self.vod.file.is_none() {
                return Err(ConfigError::invalid("vod.file", "required for uploads"));
            }
            if self.vod.url_import && self.vod.import_url.trim().is_empty() {
                return Err(ConfigError::invalid("vod.import_url", "must not be empty"));
            }
            if !(self.vod.url_import || self.vod.direct_upload || self.vod.resumable_upload) {
                return Err(ConfigError::invalid("vod", "all vod phases are disabled"));
            }
        }
        if self.transcode.enabled {
            if self.transcode.input_url.is_none() {
                return Err(ConfigError::invalid("transcode.input_url", "should be specified"));
            }
            if self.transcode.bucket_url.is_none() {
                return Err(ConfigError::invalid("transcode.bucket_url", "should be specified"));
            }
        }
        if self.live.enabled {
            if self.live.file.is_none() {
                return Err(ConfigError::invalid("live.file", "should be specified"));
            }
            if self.live.stream_duration_seconds == 0 {
                return Err(ConfigError::invalid(
                    "live.stream_duration_seconds",
                    "must be positive",
                ));
            }
        }
        if self.polling.task_poll_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "polling.task_poll_interval_seconds",
                "must be positive",
            ));
        }
        if self.polling.manifest_poll_interval_seconds == 0 {
            return Err(ConfigError::invalid(
                "polling.manifest_poll_interval_seconds",
                "must be positive",
            ));
        }
        if mode == RunMode::Continuous {
            match self.continuous.total_duration_seconds {
                Some(seconds) if seconds > 0 => {}
                _ => {
                    return Err(ConfigError::invalid(
                        "continuous.total_duration_seconds",
                        "should be specified",
                    ))
                }
            }
            if self.continuous.pause_seconds > MAX_PAUSE_SECONDS {
                return Err(ConfigError::invalid(
                    "continuous.pause_seconds",
                    "pause should be less than 5 min",
                ));
            }
        }
        if self.geo.enabled {
            if self.geo.node_source.is_none() {
                return Err(ConfigError::invalid(
                    "geo.node_source",
                    "needed when geo selection is enabled",
                ));
            }
            if !(-90.0..=90.0).contains(&self.geo.latitude) {
                return Err(ConfigError::invalid("geo.latitude", "out of range"));
            }
            if !(-180.0..=180.0).contains(&self.geo.longitude) {
                return Err(ConfigError::invalid("geo.longitude", "out of range"));
            }
            if self.geo.node_count == 0 {
                return Err(ConfigError::invalid("geo.node_count", "must be positive"));
            }
        }
        Ok(())
    }

    /// Copy of the snapshot with credentials masked, for printing.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.api.access_token.is_some() {
            copy.api.access_token = Some(REDACTED.to_string());
        }
        if copy.transcode.bucket_url.is_some() {
            copy.transcode.bucket_url = Some(REDACTED.to_string());
        }
        if copy.transcode.w3s_proof.is_some() {
            copy.transcode.w3s_proof = Some(REDACTED.to_string());
        }
        if let Some(discord) = copy.alerts.discord.as_mut() {
            discord.webhook_url = REDACTED.to_string();
        }
        if let Some(pagerduty) = copy.alerts.pagerduty.as_mut() {
            pagerduty.integration_key = REDACTED.to_string();
        }
        copy
    }
}

fn default_request_timeout() -> u64 {
    8
}

pub fn load_tester_config<P: AsRef<Path>>(path: P) -> Result<TesterConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
