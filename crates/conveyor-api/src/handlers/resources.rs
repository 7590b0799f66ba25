//! Resource, version and check handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conveyor_core::Error;
use conveyor_core::check::CheckHandle;
use conveyor_core::ids::{CheckId, ScopeId, VersionId};
use conveyor_core::pipeline::{CheckableKind, Pipeline, ResourceState};
use conveyor_core::version::{ResourceScope, ResourceVersion};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{find_pipeline, parse_id};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ResourceView {
    #[serde(flatten)]
    pub state: ResourceState,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Check bookkeeping of the shared scope.
    pub scope: Option<ResourceScope>,
}

#[derive(Deserialize)]
pub struct VersionsParams {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct PinRequest {
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Serialize)]
pub struct ClearResponse {
    pub deleted: u64,
}

async fn view(
    state: &AppState,
    pipeline: &Pipeline,
    kind: CheckableKind,
    name: &str,
) -> ApiResult<ResourceView> {
    let checkable = pipeline
        .config
        .checkable(kind, name)
        .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;
    let resource_state = state
        .pipelines
        .resource_state(pipeline.id, kind, name)
        .await?
        .ok_or_else(|| Error::ResourceNotFound(name.to_string()))?;
    let scope = match &resource_state.scope_id {
        Some(id) => state.versions.get_scope(id).await?,
        None => None,
    };
    Ok(ResourceView {
        state: resource_state,
        resource_type: checkable.resource_type,
        scope,
    })
}

/// The scope a resource's versions currently live in.
async fn resource_scope(state: &AppState, pipeline: &Pipeline, resource: &str) -> ApiResult<ScopeId> {
    let resource_state = state
        .pipelines
        .resource_state(pipeline.id, CheckableKind::Resource, resource)
        .await?
        .ok_or_else(|| Error::ResourceNotFound(resource.to_string()))?;
    Ok(resource_state
        .scope_id
        .ok_or_else(|| Error::ScopeNotFound(format!("resource {resource} has not been checked")))?)
}

/// A version of the resource, which must belong to its current scope.
async fn resource_version(
    state: &AppState,
    pipeline: &Pipeline,
    resource: &str,
    raw_id: &str,
) -> ApiResult<ResourceVersion> {
    let id: VersionId = parse_id(raw_id, "version")?;
    let scope = resource_scope(state, pipeline, resource).await?;
    match state.versions.get_version(id).await? {
        Some(version) if version.scope_id == scope => Ok(version),
        _ => Err(Error::VersionNotFound(raw_id.to_string()).into()),
    }
}

pub async fn list_resources(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<Json<Vec<ResourceView>>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let mut views = Vec::new();
    for checkable in pipeline.config.checkables() {
        views.push(view(&state, &pipeline, checkable.kind, &checkable.name).await?);
    }
    Ok(Json(views))
}

pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource)): Path<(String, String, String)>,
) -> ApiResult<Json<ResourceView>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    Ok(Json(
        view(&state, &pipeline, CheckableKind::Resource, &resource).await?,
    ))
}

/// Start an out-of-cycle check. Poll the returned handle at `/checks/{id}`.
pub async fn check_resource(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource)): Path<(String, String, String)>,
) -> ApiResult<(StatusCode, Json<CheckHandle>)> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let handle = state
        .checker
        .request_check(pipeline.id, CheckableKind::Resource, &resource)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn check_resource_type(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource_type)): Path<(String, String, String)>,
) -> ApiResult<(StatusCode, Json<CheckHandle>)> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let handle = state
        .checker
        .request_check(pipeline.id, CheckableKind::ResourceType, &resource_type)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(handle)))
}

pub async fn check_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CheckHandle>> {
    let id: CheckId = parse_id(&id, "check")?;
    Ok(Json(state.checker.check_status(id)?))
}

/// Versions of a resource, newest first.
pub async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource)): Path<(String, String, String)>,
    Query(params): Query<VersionsParams>,
) -> ApiResult<Json<Vec<ResourceVersion>>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let scope = resource_scope(&state, &pipeline, &resource).await?;
    Ok(Json(state.versions.versions(&scope, params.limit).await?))
}

pub async fn enable_version(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource, version)): Path<(String, String, String, String)>,
) -> ApiResult<StatusCode> {
    set_enabled(&state, &team, &name, &resource, &version, true).await
}

pub async fn disable_version(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource, version)): Path<(String, String, String, String)>,
) -> ApiResult<StatusCode> {
    set_enabled(&state, &team, &name, &resource, &version, false).await
}

async fn set_enabled(
    state: &AppState,
    team: &str,
    name: &str,
    resource: &str,
    raw_id: &str,
    enabled: bool,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(state, team, name).await?;
    let version = resource_version(state, &pipeline, resource, raw_id).await?;
    state.versions.set_version_enabled(version.id, enabled).await?;
    info!(
        pipeline = %pipeline.name,
        resource,
        version_id = %version.id,
        enabled,
        "Version availability changed"
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pin_version(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource, version)): Path<(String, String, String, String)>,
    Json(request): Json<PinRequest>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let version = resource_version(&state, &pipeline, &resource, &version).await?;
    state
        .pipelines
        .pin_version(pipeline.id, &resource, Some(version.id), request.comment.as_deref())
        .await?;
    info!(pipeline = %pipeline.name, resource, version_id = %version.id, "Resource pinned");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpin_version(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state
        .pipelines
        .pin_version(pipeline.id, &resource, None, None)
        .await?;
    info!(pipeline = %pipeline.name, resource, "Resource unpinned");
    Ok(StatusCode::NO_CONTENT)
}

/// Delete every version of the resource's scope. Resources sharing the
/// scope lose their history too.
pub async fn clear_versions(
    State(state): State<Arc<AppState>>,
    Path((team, name, resource)): Path<(String, String, String)>,
) -> ApiResult<Json<ClearResponse>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let scope = resource_scope(&state, &pipeline, &resource).await?;
    let deleted = state.versions.clear_versions(&scope).await?;
    info!(pipeline = %pipeline.name, resource, scope_id = %scope, deleted, "Versions cleared");
    Ok(Json(ClearResponse { deleted }))
}
