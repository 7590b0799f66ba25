//! Application state shared across handlers.

use conveyor_checker::Checker;
use conveyor_core::ports::{BuildRepository, PipelineRepository, VersionStore};
use conveyor_engine::Engine;
use conveyor_events::EventLog;
use conveyor_scheduler::SchedulerRunner;
use conveyor_workers::WorkerPool;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub versions: Arc<dyn VersionStore>,
    pub builds: Arc<dyn BuildRepository>,
    pub events: EventLog,
    pub pool: Arc<WorkerPool>,
    pub checker: Arc<Checker>,
    pub scheduler: Arc<SchedulerRunner>,
    pub engine: Engine,
}
