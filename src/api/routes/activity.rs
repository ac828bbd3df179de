//! Activity feed routes.

use axum::{Json, Router, extract::Query, extract::State, routing::get};

use crate::activity::ActivityEvent;
use crate::api::error::ApiResult;
use crate::api::models::LimitQuery;
use crate::api::server::AppState;

/// Create the activity router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_activity))
}

/// Recent activity events, newest first.
async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<ActivityEvent>>> {
    Ok(Json(state.engine.activity().recent(query.limit)))
}
