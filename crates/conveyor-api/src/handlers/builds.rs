//! Build handlers, including the server-sent event stream.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
};
use conveyor_core::Error;
use conveyor_core::build::{Build, BuildInput, BuildOutput, NewBuild};
use conveyor_core::events::BuildEvent;
use conveyor_core::ids::BuildId;
use conveyor_core::pipeline::StepConfig;
use conveyor_core::ports::BuildDispatcher;
use conveyor_scheduler::compile_one_off;
use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};

use super::parse_id;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListBuildsParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Deserialize)]
pub struct EventsParams {
    /// First event id to send.
    pub from: Option<u64>,
}

#[derive(Deserialize)]
pub struct OneOffRequest {
    pub plan: Vec<StepConfig>,
}

#[derive(Serialize)]
pub struct BuildView {
    #[serde(flatten)]
    pub build: Build,
    pub inputs: Vec<BuildInput>,
    pub outputs: Vec<BuildOutput>,
}

async fn load(state: &AppState, raw_id: &str) -> ApiResult<Build> {
    let id: BuildId = parse_id(raw_id, "build")?;
    Ok(state
        .builds
        .get(id)
        .await?
        .ok_or_else(|| Error::BuildNotFound(raw_id.to_string()))?)
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBuildsParams>,
) -> ApiResult<Json<Vec<Build>>> {
    Ok(Json(state.builds.list_recent(params.limit).await?))
}

pub async fn get_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<BuildView>> {
    let build = load(&state, &id).await?;
    let inputs = state.builds.inputs(build.id).await?;
    let outputs = state.builds.outputs(build.id).await?;
    Ok(Json(BuildView {
        build,
        inputs,
        outputs,
    }))
}

/// Run a step tree outside any pipeline.
pub async fn create_one_off(
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
    Json(request): Json<OneOffRequest>,
) -> ApiResult<(StatusCode, Json<Build>)> {
    let plan = compile_one_off(&request.plan).map_err(Error::from)?;
    let build = state.builds.create(NewBuild::one_off(team, plan)).await?;
    info!(build_id = %build.id, team = %build.team, "One-off build created");
    state.engine.dispatch(build.clone()).await?;
    Ok((StatusCode::CREATED, Json(build)))
}

pub async fn abort_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Build>> {
    let build = load(&state, &id).await?;
    Ok(Json(state.engine.abort(build.id).await?))
}

/// Stream a build's events from `?from=` or just after `Last-Event-ID`.
///
/// Each event carries its id as the SSE id. Once the build's log is closed
/// and drained the stream sends an `end` event and closes.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<EventsParams>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let build = load(&state, &id).await?;
    let resume = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|last| last + 1);
    let from = params.from.or(resume).unwrap_or(0);

    let build_id = build.id;
    let mut log = state.events.subscribe(build_id, from);
    let events = stream! {
        while let Some(next) = log.next().await {
            match next {
                Ok(event) => {
                    if let Some(event) = sse_event(&event) {
                        yield Ok::<_, Infallible>(event);
                    }
                }
                // The client reconnects with Last-Event-ID.
                Err(e) => {
                    warn!(build_id = %build_id, error = %e, "Event stream failed");
                    return;
                }
            }
        }
        yield Ok(Event::default().event("end").data(""));
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &BuildEvent) -> Option<Event> {
    Event::default()
        .id(event.id.to_string())
        .event("event")
        .json_data(event)
        .ok()
}
