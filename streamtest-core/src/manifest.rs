//! HLS manifest parsing and inspection.

use std::fmt;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::error::{TesterError, TesterResult};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("missing #EXTM3U header")]
    MissingHeader,
    #[error("invalid {tag} value: {value}")]
    InvalidTag { tag: &'static str, value: String },
    #[error("playlist missing segments")]
    NoSegments,
    #[error("master playlist lists no variants")]
    NoVariants,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HlsSegment {
    pub duration: f64,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaPlaylist {
    pub version: u32,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub segments: Vec<HlsSegment>,
}

impl MediaPlaylist {
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Variant {
    pub uri: String,
    pub bandwidth: Option<u64>,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Playlist {
    Master(Vec<Variant>),
    Media(MediaPlaylist),
}

impl Playlist {
    pub fn parse(contents: &str) -> Result<Self, ManifestError> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err(ManifestError::MissingHeader);
        }
        if contents.contains("#EXT-X-STREAM-INF") {
            parse_master(contents).map(Playlist::Master)
        } else {
            parse_media(contents).map(Playlist::Media)
        }
    }
}

fn parse_master(contents: &str) -> Result<Vec<Variant>, ManifestError> {
    let mut variants = Vec::new();
    let mut pending: Option<(Option<u64>, Option<String>)> = None;
    for line in contents.lines().map(str::trim) {
        if let Some(attributes) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let mut bandwidth = None;
            let mut resolution = None;
            for (key, value) in split_attributes(attributes) {
                match key {
                    "BANDWIDTH" => {
                        bandwidth = Some(value.parse().map_err(|_| ManifestError::InvalidTag {
                            tag: "BANDWIDTH",
                            value: value.to_string(),
                        })?)
                    }
                    "RESOLUTION" => resolution = Some(value.to_string()),
                    _ => {}
                }
            }
            pending = Some((bandwidth, resolution));
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else if let Some((bandwidth, resolution)) = pending.take() {
            variants.push(Variant {
                uri: line.to_string(),
                bandwidth,
                resolution,
            });
        }
    }
    if variants.is_empty() {
        return Err(ManifestError::NoVariants);
    }
    Ok(variants)
}

/// Splits `KEY=value,KEY="quoted,value"` attribute lists.
fn split_attributes(attributes: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    let mut rest = attributes;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], quoted[end + 1..].trim_start_matches(',')),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => (after, ""),
            }
        };
        pairs.push((key, value));
        rest = remaining;
    }
    pairs
}

fn parse_media(contents: &str) -> Result<MediaPlaylist, ManifestError> {
    let mut version = 3u32;
    let mut target_duration = 4.0f64;
    let mut media_sequence = 0u64;
    let mut segments = Vec::new();
    let mut pending_duration: Option<f64> = None;
    for line in contents.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
            version = value.parse().map_err(|_| ManifestError::InvalidTag {
                tag: "EXT-X-VERSION",
                value: value.to_string(),
            })?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = value.parse().map_err(|_| ManifestError::InvalidTag {
                tag: "EXT-X-TARGETDURATION",
                value: value.to_string(),
            })?;
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value.parse().map_err(|_| ManifestError::InvalidTag {
                tag: "EXT-X-MEDIA-SEQUENCE",
                value: value.to_string(),
            })?;
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value.split(',').next().unwrap_or_default().trim();
            pending_duration = Some(duration.parse().map_err(|_| ManifestError::InvalidTag {
                tag: "EXTINF",
                value: value.to_string(),
            })?);
        } else if line.starts_with('#') || line.is_empty() {
            continue;
        } else if let Some(duration) = pending_duration.take() {
            segments.push(HlsSegment {
                duration,
                uri: line.to_string(),
            });
        }
    }
    if segments.is_empty() {
        return Err(ManifestError::NoSegments);
    }
    Ok(MediaPlaylist {
        version,
        target_duration,
        media_sequence,
        segments,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenditionStats {
    pub uri: String,
    pub bandwidth: Option<u64>,
    pub segments: usize,
    pub duration: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManifestStats {
    pub renditions: Vec<RenditionStats>,
}

impl ManifestStats {
    pub fn rendition_count(&self) -> usize {
        self.renditions.len()
    }
}

/// Fetches a manifest and reports what it contains. An error means the
/// manifest is not (yet) available or not parseable.
#[async_trait]
pub trait ManifestInspector: Send + Sync {
    async fn inspect(&self, url: &str) -> TesterResult<ManifestStats>;
}

#[derive(Clone)]
pub struct HlsManifestInspector {
    client: Client,
}

impl fmt::Debug for HlsManifestInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HlsManifestInspector").finish()
    }
}

impl HlsManifestInspector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str) -> TesterResult<Playlist> {
        let response = self.client.get(url).send().await.map_err(|err| {
            TesterError::transient(format!("error fetching manifest {url}: {err}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TesterError::remote_failure(format!(
                "manifest {url} returned status {status}"
            )));
        }
        let body = response.text().await.map_err(|err| {
            TesterError::transient(format!("error reading manifest {url}: {err}"))
        })?;
        Playlist::parse(&body)
            .map_err(|err| TesterError::verification(format!("invalid manifest {url}: {err}")))
    }
}

#[async_trait]
impl ManifestInspector for HlsManifestInspector {
    async fn inspect(&self, url: &str) -> TesterResult<ManifestStats> {
        match self.fetch(url).await? {
            Playlist::Media(playlist) => Ok(ManifestStats {
                renditions: vec![RenditionStats {
                    uri: url.to_string(),
                    bandwidth: None,
                    segments: playlist.segments.len(),
                    duration: playlist.duration(),
                }],
            }),
            Playlist::Master(variants) => {
                let base = url::Url::parse(url).map_err(|err| {
                    TesterError::verification(format!("invalid manifest url {url}: {err}"))
                })?;
                let mut renditions = Vec::with_capacity(variants.len());
                for variant in variants {
                    let variant_url = base
                        .join(&variant.uri)
                        .map_err(|err| {
                            TesterError::verification(format!(
                                "invalid rendition uri {}: {err}",
                                variant.uri
                            ))
                        })?
                        .to_string();
                    let Playlist::Media(playlist) = self.fetch(&variant_url).await? else {
                        return Err(TesterError::verification(format!(
                            "rendition {variant_url} is a master playlist"
                        )));
                    };
                    debug!(rendition = %variant_url, segments = playlist.segments.len(), "inspected rendition");
                    renditions.push(RenditionStats {
                        uri: variant_url,
                        bandwidth: variant.bandwidth,
                        segments: playlist.segments.len(),
                        duration: playlist.duration(),
                    });
                }
                Ok(ManifestStats { renditions })
            }
        }
    }
}
