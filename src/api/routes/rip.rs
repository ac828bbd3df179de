//! Rip control routes: status polling, start, cancel.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get, routing::post};

use crate::api::error::ApiResult;
use crate::api::models::{CancelRipResponse, RipStatusResponse, StartRipRequest, StartRipResponse};
use crate::api::server::AppState;

/// Create the rip router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(rip_status))
        .route("/start", post(start_rip))
        .route("/cancel", post(cancel_rip))
}

/// Polling endpoint: the frontend hits this every few seconds while a
/// rip runs.
async fn rip_status(State(state): State<AppState>) -> ApiResult<Json<RipStatusResponse>> {
    let view = state.engine.status().await;
    Ok(Json(RipStatusResponse::from_view(view)))
}

/// Start a new rip. Returns 409 when a job is already active.
async fn start_rip(
    State(state): State<AppState>,
    body: Option<Json<StartRipRequest>>,
) -> ApiResult<(StatusCode, Json<StartRipResponse>)> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let job_id = state.engine.start_rip(request.into())?;
    Ok((StatusCode::ACCEPTED, Json(StartRipResponse { job_id })))
}

/// Cancel the active rip.
async fn cancel_rip(State(state): State<AppState>) -> ApiResult<Json<CancelRipResponse>> {
    let job_id = state.engine.cancel().await?;
    Ok(Json(CancelRipResponse { job_id }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_deserializes_without_device() {
        let request: StartRipRequest = serde_json::from_str("{}").unwrap();
        assert!(request.device.is_none());
        assert!(request.title.is_none());
        assert!(request.tracks.is_empty());

        let request: StartRipRequest =
            serde_json::from_str(r#"{"device": "/dev/sr1"}"#).unwrap();
        assert_eq!(request.device.as_deref(), Some("/dev/sr1"));
    }

    #[test]
    fn test_start_request_with_confirmed_selection() {
        let request: StartRipRequest = serde_json::from_str(
            r#"{
                "device": "/dev/sr0",
                "title": "Some Show",
                "media_type": "tv",
                "season": 2,
                "tracks": [1, 3, 5]
            }"#,
        )
        .unwrap();
        assert_eq!(request.title.as_deref(), Some("Some Show"));
        assert_eq!(request.season, Some(2));
        assert_eq!(request.tracks, vec![1, 3, 5]);

        let engine_request: crate::engine::RipRequest = request.into();
        assert_eq!(engine_request.title.as_deref(), Some("Some Show"));
        assert_eq!(engine_request.tracks, vec![1, 3, 5]);
    }
}
