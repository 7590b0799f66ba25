//! API route definitions.

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{builds, health, jobs, pipelines, resources, workers};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .layer(axum_middleware::from_fn(request_id))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/teams/{team}/pipelines", pipeline_routes())
        .route("/teams/{team}/builds", post(builds::create_one_off))
        .nest("/builds", build_routes())
        .route("/checks/{id}", get(resources::check_status))
        .nest("/workers", worker_routes())
        .route("/containers", get(workers::list_containers))
        .route("/volumes", get(workers::list_volumes))
}

fn pipeline_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(pipelines::list_pipelines))
        .route(
            "/{pipeline}",
            get(pipelines::get_pipeline).delete(pipelines::delete_pipeline),
        )
        .route("/{pipeline}/config", put(pipelines::save_config))
        .route("/{pipeline}/pause", put(pipelines::pause_pipeline))
        .route("/{pipeline}/unpause", put(pipelines::unpause_pipeline))
        .route("/{pipeline}/archive", put(pipelines::archive_pipeline))
        .route("/{pipeline}/jobs", get(jobs::list_jobs))
        .route("/{pipeline}/jobs/{job}", get(jobs::get_job))
        .route(
            "/{pipeline}/jobs/{job}/builds",
            get(jobs::list_builds).post(jobs::trigger_build),
        )
        .route("/{pipeline}/jobs/{job}/pause", put(jobs::pause_job))
        .route("/{pipeline}/jobs/{job}/unpause", put(jobs::unpause_job))
        .merge(resource_routes())
}

fn resource_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{pipeline}/resources", get(resources::list_resources))
        .route("/{pipeline}/resources/{resource}", get(resources::get_resource))
        .route(
            "/{pipeline}/resources/{resource}/check",
            post(resources::check_resource),
        )
        .route(
            "/{pipeline}/resource-types/{resource_type}/check",
            post(resources::check_resource_type),
        )
        .route(
            "/{pipeline}/resources/{resource}/versions",
            get(resources::list_versions).delete(resources::clear_versions),
        )
        .route(
            "/{pipeline}/resources/{resource}/versions/{version}/enable",
            put(resources::enable_version),
        )
        .route(
            "/{pipeline}/resources/{resource}/versions/{version}/disable",
            put(resources::disable_version),
        )
        .route(
            "/{pipeline}/resources/{resource}/versions/{version}/pin",
            put(resources::pin_version),
        )
        .route(
            "/{pipeline}/resources/{resource}/pin",
            axum::routing::delete(resources::unpin_version),
        )
}

fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(builds::list_builds))
        .route("/{id}", get(builds::get_build))
        .route("/{id}/events", get(builds::stream_events))
        .route("/{id}/abort", put(builds::abort_build))
}

fn worker_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(workers::list_workers).post(workers::register_worker))
        .route(
            "/{name}",
            get(workers::get_worker).delete(workers::prune_worker),
        )
        .route("/{name}/heartbeat", put(workers::heartbeat))
        .route("/{name}/land", put(workers::land_worker))
        .route("/{name}/retire", put(workers::retire_worker))
}
