//! Title identification.
//!
//! A thin client for an external metadata service plus a local fallback
//! built from the disc label. The engine treats identification as best
//! effort: a failed lookup degrades to the fallback with zero confidence,
//! which routes the rip to review instead of failing the job.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::makemkv::DiscType;

/// Timeout for identification service calls.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// What kind of content a disc holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Movie,
    Tv,
}

/// Request sent to the identification service.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyRequest {
    pub disc_label: String,
    pub disc_type: DiscType,
    pub media_type: MediaType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_minutes: Option<u32>,
    pub size_bytes: u64,
}

/// Result of an identification attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identification {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub media_type: MediaType,
    /// Season number for TV discs.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub season: Option<u32>,
    /// Episode titles in track order for TV discs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub episode_titles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub runtime_minutes: Option<u32>,
    /// Id at the metadata provider, when a match was found.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub poster_url: Option<String>,
    /// 0..=100.
    pub confidence: u8,
}

impl Identification {
    /// Whether this identification is trustworthy enough for automatic
    /// library placement.
    pub fn is_confident(&self, threshold: u8) -> bool {
        self.confidence >= threshold
    }

    /// Low-confidence fallback built from the disc label alone.
    pub fn fallback_from_label(label: &str) -> Self {
        Self {
            title: title_from_label(label),
            year: None,
            media_type: MediaType::Movie,
            season: None,
            episode_titles: Vec::new(),
            runtime_minutes: None,
            external_id: None,
            poster_url: None,
            confidence: 0,
        }
    }

    /// Display title including the year when known, e.g. "Heat (1995)".
    pub fn display_title(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }
}

/// Turn a volume label like `THE_BIG_MOVIE` into `The Big Movie`.
pub fn title_from_label(label: &str) -> String {
    label
        .replace(['_', '.'], " ")
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identification backend.
#[async_trait]
pub trait Identifier: Send + Sync {
    async fn identify(&self, request: &IdentifyRequest) -> Result<Identification>;
}

/// reqwest-backed client for the metadata service.
pub struct MetadataServiceIdentifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MetadataServiceIdentifier {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(IDENTIFY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl Identifier for MetadataServiceIdentifier {
    async fn identify(&self, request: &IdentifyRequest) -> Result<Identification> {
        if self.base_url.is_empty() {
            return Err(Error::Identification(
                "No identification service configured".to_string(),
            ));
        }
        let url = format!("{}/identify", self.base_url.trim_end_matches('/'));
        debug!(url = %url, label = %request.disc_label, "Requesting identification");

        let mut req = self.client.post(&url).json(request);
        if !self.api_key.is_empty() {
            req = req.header("X-Api-Key", &self.api_key);
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(Error::Identification(format!(
                "Identification service returned {}",
                response.status()
            )));
        }
        let identification: Identification = response.json().await?;
        debug!(
            title = %identification.title,
            confidence = identification.confidence,
            "Identification result"
        );
        Ok(identification)
    }
}

/// Probe a media file's runtime with ffprobe, best effort.
pub async fn probe_runtime_minutes(file: &Path) -> Option<u32> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(file)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            warn!(file = %file.display(), error = %e, "ffprobe failed to run");
            e
        })
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some((seconds / 60.0).round() as u32)
}
