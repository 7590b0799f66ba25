//! Job handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use conveyor_core::Error;
use conveyor_core::build::Build;
use conveyor_core::pipeline::{JobConfig, Pipeline};
use conveyor_scheduler::TriggerOutcome;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::find_pipeline;
use crate::error::ApiResult;
use crate::state::AppState;

/// Builds scanned when looking for a job's last finished build.
const SUMMARY_SCAN: usize = 25;

#[derive(Deserialize)]
pub struct ListBuildsParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub paused: bool,
    pub pending_triggers: u32,
    pub disable_manual_trigger: bool,
    pub inputs: Vec<String>,
    /// Most recent finished build.
    pub finished_build: Option<Build>,
    /// Oldest build still pending or running.
    pub next_build: Option<Build>,
}

async fn summarize(state: &AppState, pipeline: &Pipeline, job: &JobConfig) -> ApiResult<JobSummary> {
    let job_state = state.pipelines.job_state(pipeline.id, &job.name).await?;
    let finished_build = state
        .builds
        .list_for_job(pipeline.id, &job.name, SUMMARY_SCAN)
        .await?
        .into_iter()
        .find(|b| b.status.is_terminal());
    let next_build = state
        .builds
        .active_for_job(pipeline.id, &job.name)
        .await?
        .pop();

    Ok(JobSummary {
        name: job.name.clone(),
        paused: job_state.as_ref().is_some_and(|s| s.paused),
        pending_triggers: job_state.map(|s| s.pending_triggers).unwrap_or(0),
        disable_manual_trigger: job.disable_manual_trigger,
        inputs: job.inputs().iter().map(|g| g.name.clone()).collect(),
        finished_build,
        next_build,
    })
}

fn job_config<'a>(pipeline: &'a Pipeline, job: &str) -> ApiResult<&'a JobConfig> {
    Ok(pipeline
        .config
        .job(job)
        .ok_or_else(|| Error::JobNotFound(job.to_string()))?)
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path((team, name)): Path<(String, String)>,
) -> ApiResult<Json<Vec<JobSummary>>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let mut jobs = Vec::with_capacity(pipeline.config.jobs.len());
    for job in &pipeline.config.jobs {
        jobs.push(summarize(&state, &pipeline, job).await?);
    }
    Ok(Json(jobs))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path((team, name, job)): Path<(String, String, String)>,
) -> ApiResult<Json<JobSummary>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let config = job_config(&pipeline, &job)?;
    Ok(Json(summarize(&state, &pipeline, config).await?))
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Path((team, name, job)): Path<(String, String, String)>,
    Query(params): Query<ListBuildsParams>,
) -> ApiResult<Json<Vec<Build>>> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    job_config(&pipeline, &job)?;
    let builds = state
        .builds
        .list_for_job(pipeline.id, &job, params.limit)
        .await?;
    Ok(Json(builds))
}

/// Manually trigger a job. Answers 201 with the build when it could be
/// created now, 202 when the request was queued.
pub async fn trigger_build(
    State(state): State<Arc<AppState>>,
    Path((team, name, job)): Path<(String, String, String)>,
) -> ApiResult<(StatusCode, Json<TriggerOutcome>)> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    let outcome = state.scheduler.context(pipeline.id).trigger_job(&job).await?;
    let status = match outcome {
        TriggerOutcome::Created(_) => StatusCode::CREATED,
        TriggerOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

pub async fn pause_job(
    State(state): State<Arc<AppState>>,
    Path((team, name, job)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state.pipelines.set_job_paused(pipeline.id, &job, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unpause_job(
    State(state): State<Arc<AppState>>,
    Path((team, name, job)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let pipeline = find_pipeline(&state, &team, &name).await?;
    state.pipelines.set_job_paused(pipeline.id, &job, false).await?;
    Ok(StatusCode::NO_CONTENT)
}
