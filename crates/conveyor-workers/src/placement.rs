//! Worker selection for step placement.

use conveyor_core::Error;
use conveyor_core::worker::{StepRequirements, Worker, WorkerState};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no workers registered")]
    NoWorkers,

    #[error("no running worker satisfies {0}")]
    NoMatch(String),
}

impl From<PlacementError> for Error {
    fn from(e: PlacementError) -> Self {
        Error::NoWorkerFits(e.to_string())
    }
}

/// Whether a worker may run a step with these requirements.
pub fn eligible(worker: &Worker, req: &StepRequirements) -> bool {
    worker.state == WorkerState::Running
        && req.platform.as_ref().is_none_or(|p| &worker.platform == p)
        && req.tags.iter().all(|t| worker.tags.contains(t))
        && worker.team.as_ref().is_none_or(|team| team == &req.team)
        && req
            .resource_type
            .as_ref()
            .is_none_or(|t| worker.supports(t))
}

/// Pick a worker for a step.
///
/// Among eligible workers, those holding the requested cached version come
/// first, then the least loaded by active containers, then by name.
pub fn select_worker<'a>(
    workers: &'a [Worker],
    req: &StepRequirements,
    cache_holders: &HashSet<String>,
) -> Result<&'a Worker, PlacementError> {
    if workers.is_empty() {
        return Err(PlacementError::NoWorkers);
    }

    workers
        .iter()
        .filter(|w| eligible(w, req))
        .min_by(|a, b| {
            let a_cached = cache_holders.contains(&a.name);
            let b_cached = cache_holders.contains(&b.name);
            b_cached
                .cmp(&a_cached)
                .then(a.active_containers.cmp(&b.active_containers))
                .then_with(|| a.name.cmp(&b.name))
        })
        .ok_or_else(|| PlacementError::NoMatch(describe(req)))
}

fn describe(req: &StepRequirements) -> String {
    let mut parts = vec![format!("team={}", req.team)];
    if let Some(platform) = &req.platform {
        parts.push(format!("platform={platform}"));
    }
    if !req.tags.is_empty() {
        parts.push(format!("tags={}", req.tags.join(",")));
    }
    if let Some(resource_type) = &req.resource_type {
        parts.push(format!("resource_type={resource_type}"));
    }
    parts.join(" ")
}
