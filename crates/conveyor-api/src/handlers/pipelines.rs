//! Pipeline handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use conveyor_core::pipeline::{Pipeline, PipelineConfig};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use super::find_pipeline;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SaveConfigRequest {
    pub config: PipelineConfig,
    /// Config version the client last saw; the save fails if it moved on.
    #[serde(default)]
    pub expected_version: Option<i64>,
}

pub async fn list_pipelines(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
) -> ApiResult<Json<Vec<Pipeline>>> {
    let pipelines = state
        .pipelines
        .list()
        .await?
        .into_iter()
        .filter(|p| p.team == team)
        .collect();
    Ok(Json(pipelines))
}

pub async fn get_pipeline(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<Json<Pipeline>> {
    Ok(Json(find_pipeline(&state, &team, &name).await?))
}

/// Create or update a pipeline's config.
pub async fn save_config(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
    Json(request): Json<SaveConfigRequest>,
) -> ApiResult<Json<Pipeline>> {
    let pipeline = state
        .pipelines
        .save(&team, &name, &request.config, request.expected_version)
        .await?;
    info!(
        pipeline = %pipeline.name,
        team = %pipeline.team,
        config_version = pipeline.config_version,
        "Pipeline config saved"
    );
    Ok(Json(pipeline))
}

pub async fn pause_pipeline(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state.pipelines.set_paused(pipeline.id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpause_pipeline(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state.pipelines.set_paused(pipeline.id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn archive_pipeline(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state.pipelines.archive(pipeline.id).await?;
    info!(pipeline = %pipeline.name, team = %pipeline.team, "Pipeline archived");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_pipeline(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state.pipelines.delete(pipeline.id).await?;
    info!(pipeline = %pipeline.name, team = %pipeline.team, "Pipeline deleted");
    Ok(StatusCode::NO_CONTENT)
}
