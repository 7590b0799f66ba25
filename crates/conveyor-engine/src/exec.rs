//! Walks a build's plan tree.
//!
//! Every node runs as a future returning its terminal status. Composite
//! nodes combine their children's statuses; leaves live in `steps`.

use conveyor_core::build::{Build, BuildStatus};
use conveyor_core::events::{AttemptPayload, EventOrigin, EventPayload};
use conveyor_core::ids::PlanId;
use conveyor_core::plan::{HookPlan, Plan, PlanStep};
use conveyor_core::ports::{BuildRepository, VersionStore};
use conveyor_core::worker::Volume;
use conveyor_core::Error;
use conveyor_events::EventLog;
use conveyor_workers::WorkerPool;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A named volume produced by an earlier step of the build.
#[derive(Debug, Clone)]
pub(crate) struct Artifact {
    pub worker: String,
    pub volume: Volume,
}

/// State shared by every step of one executing build.
pub(crate) struct BuildRun {
    pub(crate) build: Build,
    pub(crate) builds: Arc<dyn BuildRepository>,
    pub(crate) versions: Arc<dyn VersionStore>,
    pub(crate) events: EventLog,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) output_buffer: usize,
    artifacts: Mutex<HashMap<String, Artifact>>,
    /// Volumes to destroy once the build is over.
    scratch: Mutex<Vec<Volume>>,
}

impl BuildRun {
    pub(crate) fn new(
        build: Build,
        builds: Arc<dyn BuildRepository>,
        versions: Arc<dyn VersionStore>,
        events: EventLog,
        pool: Arc<WorkerPool>,
        output_buffer: usize,
    ) -> Self {
        Self {
            build,
            builds,
            versions,
            events,
            pool,
            output_buffer,
            artifacts: Mutex::new(HashMap::new()),
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Append a step event. Step events are informational; a failed append
    /// is logged rather than failing the step.
    pub(crate) async fn emit(&self, payload: EventPayload) {
        if let Err(e) = self.events.append(self.build.id, payload).await {
            warn!(build_id = %self.build.id, error = %e, "Failed to append build event");
        }
    }

    pub(crate) async fn artifact(&self, name: &str) -> Option<Artifact> {
        self.artifacts.lock().await.get(name).cloned()
    }

    pub(crate) async fn all_artifacts(&self) -> Vec<(String, Artifact)> {
        let mut all: Vec<_> = self
            .artifacts
            .lock()
            .await
            .iter()
            .map(|(name, a)| (name.clone(), a.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub(crate) async fn register(&self, name: &str, artifact: Artifact) {
        self.artifacts.lock().await.insert(name.to_string(), artifact);
    }

    pub(crate) async fn track_scratch(&self, volume: Volume) {
        self.scratch.lock().await.push(volume);
    }

    /// Destroy the build's scratch volumes.
    pub(crate) async fn cleanup(&self) {
        let volumes: Vec<Volume> = self.scratch.lock().await.drain(..).collect();
        for volume in volumes {
            if let Err(e) = self.pool.destroy_volume(&volume).await {
                warn!(build_id = %self.build.id, volume_id = %volume.id, error = %e, "Failed to destroy build volume");
            }
        }
    }

    /// Run `plan` to a terminal status.
    pub(crate) fn execute(
        self: Arc<Self>,
        plan: Plan,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, BuildStatus> {
        async move {
            if cancel.is_cancelled() {
                return BuildStatus::Aborted;
            }
            let Plan { id, step } = plan;
            match step {
                PlanStep::Get(get) => self.run_get(id, get, cancel).await,
                PlanStep::Put(put) => self.run_put(id, put, cancel).await,
                PlanStep::Task(task) => self.run_task(id, task, cancel).await,
                PlanStep::Do(steps) => self.sequence(steps, cancel).await,
                PlanStep::InParallel {
                    steps,
                    limit,
                    fail_fast,
                } => self.parallel(steps, limit, fail_fast, cancel).await,
                PlanStep::Aggregate(steps) => self.parallel(steps, None, false, cancel).await,
                PlanStep::OnSuccess(hook) => self.hooked(hook, cancel, Hook::Success).await,
                PlanStep::OnFailure(hook) => self.hooked(hook, cancel, Hook::Failure).await,
                PlanStep::OnError(hook) => self.hooked(hook, cancel, Hook::Error).await,
                PlanStep::OnAbort(hook) => self.hooked(hook, cancel, Hook::Abort).await,
                PlanStep::Ensure(hook) => self.hooked(hook, cancel, Hook::Ensure).await,
                PlanStep::Try(step) => match self.execute(*step, cancel).await {
                    BuildStatus::Aborted => BuildStatus::Aborted,
                    _ => BuildStatus::Succeeded,
                },
                PlanStep::Timeout {
                    step,
                    duration_secs,
                } => self.timeout(id, *step, duration_secs, cancel).await,
                PlanStep::Retry(attempts) => self.retry(attempts, cancel).await,
            }
        }
        .boxed()
    }

    async fn sequence(self: Arc<Self>, steps: Vec<Plan>, cancel: CancellationToken) -> BuildStatus {
        for step in steps {
            let status = self.clone().execute(step, cancel.clone()).await;
            if status != BuildStatus::Succeeded {
                return status;
            }
        }
        BuildStatus::Succeeded
    }

    async fn parallel(
        self: Arc<Self>,
        steps: Vec<Plan>,
        limit: Option<usize>,
        fail_fast: bool,
        cancel: CancellationToken,
    ) -> BuildStatus {
        if steps.is_empty() {
            return BuildStatus::Succeeded;
        }
        let siblings = cancel.child_token();
        let permits = Arc::new(Semaphore::new(
            limit.filter(|l| *l > 0).unwrap_or(steps.len()),
        ));

        let mut set = JoinSet::new();
        for step in steps {
            let run = self.clone();
            let token = siblings.clone();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => permit.ok(),
                    _ = token.cancelled() => return BuildStatus::Aborted,
                };
                run.execute(step, token).await
            });
        }

        let mut status = BuildStatus::Succeeded;
        let mut failed_fast = false;
        while let Some(joined) = set.join_next().await {
            let child = joined.unwrap_or_else(|e| {
                warn!(build_id = %self.build.id, error = %e, "Parallel branch panicked");
                BuildStatus::Errored
            });
            // Siblings cancelled by fail-fast do not mask the failure.
            if failed_fast && child == BuildStatus::Aborted {
                continue;
            }
            status = status.worst(child);
            if fail_fast
                && !failed_fast
                && matches!(child, BuildStatus::Failed | BuildStatus::Errored)
            {
                failed_fast = true;
                siblings.cancel();
            }
        }

        if cancel.is_cancelled() {
            BuildStatus::Aborted
        } else {
            status
        }
    }

    async fn hooked(self: Arc<Self>, hook: HookPlan, cancel: CancellationToken, kind: Hook) -> BuildStatus {
        let HookPlan { step, hook } = hook;
        let status = self.clone().execute(*step, cancel.clone()).await;

        match kind {
            Hook::Success if status == BuildStatus::Succeeded => self.execute(*hook, cancel).await,
            Hook::Failure if status == BuildStatus::Failed => {
                self.execute(*hook, cancel).await;
                status
            }
            Hook::Error if status == BuildStatus::Errored => {
                self.execute(*hook, cancel).await;
                status
            }
            // Cleanup runs even though the build is being cancelled.
            Hook::Abort if status == BuildStatus::Aborted => {
                self.execute(*hook, CancellationToken::new()).await;
                status
            }
            Hook::Ensure => {
                let hook_status = self.execute(*hook, CancellationToken::new()).await;
                if status == BuildStatus::Succeeded {
                    hook_status
                } else {
                    status
                }
            }
            _ => status,
        }
    }

    async fn timeout(
        self: Arc<Self>,
        id: PlanId,
        step: Plan,
        duration_secs: u64,
        cancel: CancellationToken,
    ) -> BuildStatus {
        let child = cancel.child_token();
        let mut handle = tokio::spawn(self.clone().execute(step, child.clone()));

        tokio::select! {
            joined = &mut handle => joined.unwrap_or(BuildStatus::Errored),
            _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {
                child.cancel();
                // The step releases its containers before we report.
                let _ = handle.await;
                if cancel.is_cancelled() {
                    return BuildStatus::Aborted;
                }
                self.emit(EventPayload::error(
                    Some(EventOrigin::new(id, None)),
                    Error::Timeout { secs: duration_secs }.to_string(),
                ))
                .await;
                BuildStatus::Errored
            }
        }
    }

    async fn retry(self: Arc<Self>, attempts: Vec<Plan>, cancel: CancellationToken) -> BuildStatus {
        let mut status = BuildStatus::Succeeded;
        for (n, attempt) in attempts.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return BuildStatus::Aborted;
            }
            self.emit(EventPayload::Attempt(AttemptPayload {
                origin: EventOrigin::new(attempt.id.clone(), None),
                attempt: n as u32 + 1,
            }))
            .await;
            status = self.clone().execute(attempt, cancel.clone()).await;
            if matches!(status, BuildStatus::Succeeded | BuildStatus::Aborted) {
                break;
            }
        }
        status
    }
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Success,
    Failure,
    Error,
    Abort,
    Ensure,
}
