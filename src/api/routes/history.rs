//! Rip history routes.

use axum::{Json, Router, extract::Query, extract::State, routing::get};

use crate::api::error::ApiResult;
use crate::api::models::LimitQuery;
use crate::api::server::AppState;
use crate::history::HistoryEntry;

/// Create the history router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_history))
}

/// Recent finished rips, newest first.
async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<HistoryEntry>>> {
    let entries = state.engine.history().recent(query.limit).await?;
    Ok(Json(entries))
}
