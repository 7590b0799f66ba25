//! Worker, container and volume handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conveyor_core::worker::{Container, Volume, Worker, WorkerRegistration};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WorkerFilter {
    pub worker: Option<String>,
}

#[derive(Serialize)]
pub struct RetireResponse {
    /// Whether the worker was removed right away rather than draining.
    pub removed: bool,
}

pub async fn list_workers(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Worker>>> {
    Ok(Json(state.pool.list().await?))
}

pub async fn get_worker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.pool.get(&name).await?))
}

/// Register a worker or refresh its registration.
pub async fn register_worker(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<WorkerRegistration>,
) -> ApiResult<(StatusCode, Json<Worker>)> {
    let worker = state.pool.register(registration).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.pool.heartbeat(&name).await?))
}

pub async fn land_worker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Worker>> {
    Ok(Json(state.pool.land(&name).await?))
}

pub async fn retire_worker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<RetireResponse>> {
    let removed = state.pool.retire(&name).await?;
    Ok(Json(RetireResponse { removed }))
}

/// Remove a stalled or landed worker with everything recorded on it.
pub async fn prune_worker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.pool.prune(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_containers(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<WorkerFilter>,
) -> ApiResult<Json<Vec<Container>>> {
    let containers = state
        .pool
        .repository()
        .list_containers(filter.worker.as_deref())
        .await?;
    Ok(Json(containers))
}

pub async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<WorkerFilter>,
) -> ApiResult<Json<Vec<Volume>>> {
    let volumes = state
        .pool
        .repository()
        .list_volumes(filter.worker.as_deref())
        .await?;
    Ok(Json(volumes))
}
