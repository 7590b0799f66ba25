//! Build lifecycle: start, run, abort, finish and crash recovery.

use crate::config::EngineConfig;
use crate::exec::BuildRun;
use async_trait::async_trait;
use conveyor_core::build::{Build, BuildStatus};
use conveyor_core::events::EventPayload;
use conveyor_core::ids::BuildId;
use conveyor_core::lock::LockId;
use conveyor_core::ports::{BuildDispatcher, BuildRepository, LockFactory, VersionStore};
use conveyor_core::{Error, Result};
use conveyor_events::EventLog;
use conveyor_workers::WorkerPool;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What [`Engine::recover`] did with builds left over from a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Started builds that were marked errored.
    pub errored: usize,
    /// Pending builds handed back to execution.
    pub redispatched: usize,
}

/// Executes builds. Cheap to clone; clones share running builds.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    builds: Arc<dyn BuildRepository>,
    versions: Arc<dyn VersionStore>,
    locks: Arc<dyn LockFactory>,
    events: EventLog,
    pool: Arc<WorkerPool>,
    config: EngineConfig,
    /// Cancellation of each build executing in this process.
    running: DashMap<BuildId, CancellationToken>,
}

impl Engine {
    pub fn new(
        builds: Arc<dyn BuildRepository>,
        versions: Arc<dyn VersionStore>,
        locks: Arc<dyn LockFactory>,
        events: EventLog,
        pool: Arc<WorkerPool>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                builds,
                versions,
                locks,
                events,
                pool,
                config,
                running: DashMap::new(),
            }),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn is_running(&self, id: BuildId) -> bool {
        self.inner.running.contains_key(&id)
    }

    /// Run a build in the background.
    pub fn spawn(&self, id: BuildId) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_build(id).await {
                error!(build_id = %id, error = %e, "Build execution failed");
            }
        });
    }

    /// Run a pending build to completion and return its final status.
    ///
    /// Builds that are not pending, or that another tracker holds, are left
    /// alone and their current status is returned.
    pub async fn run_build(&self, id: BuildId) -> Result<BuildStatus> {
        let Some(lock) = self.inner.locks.try_acquire(&LockId::build(id)).await? else {
            debug!(build_id = %id, "Build is tracked elsewhere");
            return Ok(self.get(id).await?.status);
        };
        let result = self.track(id).await;
        if let Err(e) = lock.release().await {
            warn!(build_id = %id, error = %e, "Failed to release build lock");
        }
        result
    }

    async fn track(&self, id: BuildId) -> Result<BuildStatus> {
        let build = self.get(id).await?;
        if build.status != BuildStatus::Pending {
            return Ok(build.status);
        }
        if build.abort_requested {
            self.finish(&build, BuildStatus::Pending, BuildStatus::Aborted)
                .await?;
            return Ok(BuildStatus::Aborted);
        }
        let Some(plan) = build.plan.clone() else {
            self.inner
                .events
                .append(
                    id,
                    EventPayload::error(None, Error::BuildHasNoPlan(id.to_string()).to_string()),
                )
                .await?;
            self.finish(&build, BuildStatus::Pending, BuildStatus::Errored)
                .await?;
            return Ok(BuildStatus::Errored);
        };

        // The build lock is held, so nothing else moves the build out of pending.
        self.inner
            .events
            .append(id, EventPayload::status(BuildStatus::Started))
            .await?;
        if !self
            .inner
            .builds
            .transition(id, BuildStatus::Pending, BuildStatus::Started)
            .await?
        {
            return Ok(self.get(id).await?.status);
        }
        info!(build_id = %id, job = build.job.as_deref().unwrap_or("one-off"), "Build started");

        let cancel = CancellationToken::new();
        self.inner.running.insert(id, cancel.clone());
        let watcher = tokio::spawn(watch_abort(
            self.inner.builds.clone(),
            id,
            cancel.clone(),
            self.inner.config.abort_poll_interval,
        ));

        let run = Arc::new(BuildRun::new(
            build,
            self.inner.builds.clone(),
            self.inner.versions.clone(),
            self.inner.events.clone(),
            self.inner.pool.clone(),
            self.inner.config.output_buffer,
        ));
        let status = run.clone().execute(plan, cancel.clone()).await;
        run.cleanup().await;

        watcher.abort();
        self.inner.running.remove(&id);
        let status = if cancel.is_cancelled() {
            BuildStatus::Aborted
        } else {
            status
        };
        self.finish(&run.build, BuildStatus::Started, status).await?;
        Ok(status)
    }

    /// Record the final status and close the build's event log.
    async fn finish(&self, build: &Build, from: BuildStatus, to: BuildStatus) -> Result<()> {
        self.inner
            .events
            .append(build.id, EventPayload::status(to))
            .await?;
        if !self.inner.builds.transition(build.id, from, to).await? {
            warn!(build_id = %build.id, from = from.as_str(), to = to.as_str(), "Build status changed underneath");
        }
        self.inner.events.finish(build.id).await?;
        info!(build_id = %build.id, status = to.as_str(), "Build finished");
        Ok(())
    }

    /// Request that a build stop.
    ///
    /// Running builds are cancelled and finish as aborted once their steps
    /// wind down. Pending builds are aborted immediately. Finished builds are
    /// returned unchanged.
    pub async fn abort(&self, id: BuildId) -> Result<Build> {
        let build = self.get(id).await?;
        if build.status.is_terminal() {
            return Ok(build);
        }
        self.inner.builds.request_abort(id).await?;

        let running = self.inner.running.get(&id).map(|t| t.clone());
        if let Some(token) = running {
            info!(build_id = %id, "Aborting running build");
            token.cancel();
        } else if build.status == BuildStatus::Pending {
            if let Some(lock) = self.inner.locks.try_acquire(&LockId::build(id)).await? {
                let result = self.abort_pending(id).await;
                if let Err(e) = lock.release().await {
                    warn!(build_id = %id, error = %e, "Failed to release build lock");
                }
                result?;
            }
        }
        // A build started by another process sees the flag on its next poll.
        self.get(id).await
    }

    async fn abort_pending(&self, id: BuildId) -> Result<()> {
        let build = self.get(id).await?;
        if build.status == BuildStatus::Pending {
            info!(build_id = %id, "Aborting pending build");
            self.finish(&build, BuildStatus::Pending, BuildStatus::Aborted)
                .await?;
        }
        Ok(())
    }

    /// Settle builds left behind by a previous process: started builds
    /// nobody tracks are errored, pending builds are run.
    pub async fn recover(&self) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();

        for build in self.inner.builds.list_by_status(BuildStatus::Started).await? {
            if self.is_running(build.id) {
                continue;
            }
            let Some(lock) = self.inner.locks.try_acquire(&LockId::build(build.id)).await? else {
                continue;
            };
            let result = self.fail_interrupted(&build).await;
            if let Err(e) = lock.release().await {
                warn!(build_id = %build.id, error = %e, "Failed to release build lock");
            }
            result?;
            summary.errored += 1;
        }

        for build in self.inner.builds.list_by_status(BuildStatus::Pending).await? {
            self.spawn(build.id);
            summary.redispatched += 1;
        }

        info!(
            errored = summary.errored,
            redispatched = summary.redispatched,
            "Recovered builds"
        );
        Ok(summary)
    }

    async fn fail_interrupted(&self, build: &Build) -> Result<()> {
        warn!(build_id = %build.id, "Build was interrupted");
        self.inner
            .events
            .append(
                build.id,
                EventPayload::error(None, "build was interrupted by an engine restart"),
            )
            .await?;
        self.finish(build, BuildStatus::Started, BuildStatus::Errored)
            .await
    }

    async fn get(&self, id: BuildId) -> Result<Build> {
        self.inner
            .builds
            .get(id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))
    }
}

#[async_trait]
impl BuildDispatcher for Engine {
    async fn dispatch(&self, build: Build) -> Result<()> {
        self.spawn(build.id);
        Ok(())
    }
}

/// Cancel `cancel` once the build's abort flag is set.
async fn watch_abort(
    builds: Arc<dyn BuildRepository>,
    id: BuildId,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        match builds.get(id).await {
            Ok(Some(build)) if build.abort_requested => {
                info!(build_id = %id, "Abort requested");
                cancel.cancel();
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(e) => warn!(build_id = %id, error = %e, "Failed to poll abort flag"),
        }
    }
}
