//! Request handlers organized by resource.

pub mod builds;
pub mod health;
pub mod jobs;
pub mod pipelines;
pub mod resources;
pub mod workers;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use conveyor_core::Error;
use conveyor_core::pipeline::Pipeline;
use std::str::FromStr;

/// Look up a pipeline by team and name.
pub(crate) async fn find_pipeline(state: &AppState, team: &str, name: &str) -> ApiResult<Pipeline> {
    state
        .pipelines
        .find(team, name)
        .await?
        .ok_or_else(|| Error::PipelineNotFound(format!("{team}/{name}")).into())
}

pub(crate) fn parse_id<T: FromStr>(raw: &str, what: &str) -> ApiResult<T> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid {what} ID")))
}
