use axum::{Json, extract::State};
use std::sync::Arc;

use super::{ApiResponse, AppState, HealthResponse};

/// `GET /health`
///
/// Liveness probe. Reports uptime and the number of open push channels.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        push_channels: state.sync.registry().subscriber_count().await,
    }))
}
