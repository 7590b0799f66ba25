//! Health check handlers.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ready once storage answers.
pub async fn ready(State(state): State<Arc<AppState>>) -> StatusCode {
    match state.pipelines.list().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Storage is not ready");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
