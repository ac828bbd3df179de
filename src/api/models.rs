//! API wire models.

use serde::{Deserialize, Serialize};

use crate::engine::{JobStatusView, RipRequest};
use crate::identify::MediaType;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Response for `GET /api/rip/status`.
#[derive(Debug, Serialize)]
pub struct RipStatusResponse {
    /// `idle` when no job occupies the slot.
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobStatusView>,
}

impl RipStatusResponse {
    pub fn from_view(view: Option<JobStatusView>) -> Self {
        match view {
            Some(view) => Self {
                state: view.job.status.to_string(),
                job: Some(view),
            },
            None => Self {
                state: "idle".to_string(),
                job: None,
            },
        }
    }
}

/// Request body for `POST /api/rip/start`.
///
/// A frontend that already ran a scan-and-identify round trip passes the
/// confirmed title and track selection here; a bare `{}` starts a fully
/// automatic rip.
#[derive(Debug, Default, Deserialize)]
pub struct StartRipRequest {
    /// Optical drive to rip from; defaults to the configured device.
    #[serde(default)]
    pub device: Option<String>,
    /// Pre-confirmed title; skips identification.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub season: Option<u32>,
    /// Track indices to rip, from a prior scan.
    #[serde(default)]
    pub tracks: Vec<u32>,
}

impl From<StartRipRequest> for RipRequest {
    fn from(request: StartRipRequest) -> Self {
        Self {
            device: request.device,
            title: request.title,
            media_type: request.media_type,
            season: request.season,
            tracks: request.tracks,
        }
    }
}

/// Response for `POST /api/rip/start`.
#[derive(Debug, Serialize)]
pub struct StartRipResponse {
    pub job_id: String,
}

/// Response for `POST /api/rip/cancel`.
#[derive(Debug, Serialize)]
pub struct CancelRipResponse {
    pub job_id: String,
}

/// Query parameters for list endpoints.
#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

impl Default for LimitQuery {
    fn default() -> Self {
        Self {
            limit: default_limit(),
        }
    }
}
