use axum::{Extension, Json, extract::State, http::StatusCode};
use chrono::Utc;
use std::sync::Arc;

use super::extract::{ValidJson, ValidPath, ValidQuery};
use super::{ApiError, ApiResponse, AppState, CreateTimerRequest, TimersQuery};
use crate::domain::{TimerId, TimerView, UserId};
use crate::services::TimerFilter;

/// GET /api/timers?isActive=true|false
pub async fn list_timers(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    ValidQuery(query): ValidQuery<TimersQuery>,
) -> Result<Json<ApiResponse<Vec<TimerView>>>, ApiError> {
    let filter = TimerFilter::from(query.is_active.unwrap_or(true));
    let timers = state.sync.get_snapshot(user_id, filter).await?;
    Ok(Json(ApiResponse::success(timers)))
}

/// POST /api/timers
pub async fn create_timer(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    ValidJson(payload): ValidJson<CreateTimerRequest>,
) -> Result<(StatusCode, Json<ApiResponse<TimerView>>), ApiError> {
    let timer = state.timers.start(user_id, &payload.description).await?;
    let view = timer.view_at(Utc::now());
    Ok((StatusCode::CREATED, Json(ApiResponse::success(view))))
}

/// POST /api/timers/{id}/stop
pub async fn stop_timer(
    State(state): State<Arc<AppState>>,
    Extension(user_id): Extension<UserId>,
    ValidPath(id): ValidPath<i64>,
) -> Result<Json<ApiResponse<TimerView>>, ApiError> {
    let timer = state.timers.stop(user_id, TimerId::new(id)).await?;
    Ok(Json(ApiResponse::success(timer.view_at(Utc::now()))))
}
