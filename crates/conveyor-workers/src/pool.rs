//! Worker lifecycle, placement and container/volume bookkeeping.

use crate::placement::{eligible, select_worker};
use chrono::Utc;
use conveyor_core::ids::{BuildId, ContainerId, PlanId, ScopeId, VersionId, VolumeId};
use conveyor_core::ports::{ContainerRuntime, WorkerRepository};
use conveyor_core::worker::{
    Container, ContainerState, StepRequirements, Volume, VolumeKind, Worker, WorkerRegistration,
    WorkerState,
};
use conveyor_core::{Error, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers silent for longer than this are marked stalled.
    pub heartbeat_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl: Duration::from_secs(30),
        }
    }
}

/// Result of placing a step.
#[derive(Debug, Clone)]
pub struct Placement {
    pub worker: Worker,
    pub container: Container,
    /// Cache volumes on the chosen worker that satisfy the requested version.
    pub volumes: Vec<Volume>,
}

pub struct WorkerPool {
    repo: Arc<dyn WorkerRepository>,
    runtime: Arc<dyn ContainerRuntime>,
    config: PoolConfig,
    lost: DashMap<String, CancellationToken>,
}

impl WorkerPool {
    pub fn new(
        repo: Arc<dyn WorkerRepository>,
        runtime: Arc<dyn ContainerRuntime>,
        config: PoolConfig,
    ) -> Self {
        Self {
            repo,
            runtime,
            config,
            lost: DashMap::new(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn repository(&self) -> &Arc<dyn WorkerRepository> {
        &self.repo
    }

    /// Register or re-register a worker. It starts out running.
    pub async fn register(&self, registration: WorkerRegistration) -> Result<Worker> {
        let worker = Worker::from_registration(registration);
        self.repo.save_worker(&worker).await?;
        self.reset_lost_signal(&worker.name);
        info!(
            worker = %worker.name,
            platform = %worker.platform,
            tags = ?worker.tags,
            "Worker registered"
        );
        Ok(worker)
    }

    /// Record a heartbeat. A stalled worker that reports in is running again.
    pub async fn heartbeat(&self, name: &str) -> Result<Worker> {
        let worker = self.get(name).await?;
        self.repo.heartbeat_worker(name, Utc::now()).await?;
        if worker.state == WorkerState::Stalled {
            self.repo.set_worker_state(name, WorkerState::Running).await?;
            self.reset_lost_signal(name);
            info!(worker = %name, "Stalled worker recovered");
        }
        debug!(worker = %name, "Heartbeat received");
        self.get(name).await
    }

    /// Stop placing on a worker and let its containers finish.
    pub async fn land(&self, name: &str) -> Result<Worker> {
        let worker = self.get(name).await?;
        match worker.state {
            WorkerState::Landing | WorkerState::Landed => return Ok(worker),
            WorkerState::Running => {}
            state => {
                return Err(Error::InvalidWorkerState {
                    name: name.to_string(),
                    state: state.as_str().to_string(),
                });
            }
        }
        self.repo.set_worker_state(name, WorkerState::Landing).await?;
        info!(worker = %name, active_containers = worker.active_containers, "Worker landing");
        self.settle(name).await?;
        self.get(name).await
    }

    /// Drain a worker and remove it once empty. Returns `true` when it was
    /// removed immediately.
    pub async fn retire(&self, name: &str) -> Result<bool> {
        let worker = self.get(name).await?;
        if worker.state == WorkerState::Stalled {
            return Err(Error::InvalidWorkerState {
                name: name.to_string(),
                state: worker.state.as_str().to_string(),
            });
        }
        self.repo.set_worker_state(name, WorkerState::Retiring).await?;
        info!(worker = %name, active_containers = worker.active_containers, "Worker retiring");
        self.settle(name).await
    }

    /// Forget a stalled or landed worker along with its containers and volumes.
    pub async fn prune(&self, name: &str) -> Result<()> {
        let worker = self.get(name).await?;
        if !matches!(worker.state, WorkerState::Stalled | WorkerState::Landed) {
            return Err(Error::InvalidWorkerState {
                name: name.to_string(),
                state: worker.state.as_str().to_string(),
            });
        }
        self.remove(name).await?;
        info!(worker = %name, "Worker pruned");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Worker>> {
        let mut workers = self.repo.list_workers().await?;
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    pub async fn get(&self, name: &str) -> Result<Worker> {
        self.repo
            .get_worker(name)
            .await?
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))
    }

    /// Choose a worker for a step and allocate its container.
    pub async fn place(
        &self,
        req: &StepRequirements,
        build_id: Option<BuildId>,
        plan_id: Option<PlanId>,
    ) -> Result<Placement> {
        let workers = self.repo.list_workers().await?;

        let mut cached = Vec::new();
        if let Some((scope_id, version_id)) = &req.cached_version {
            cached = self
                .repo
                .find_cache_volumes(&VolumeKind::ResourceCache {
                    scope_id: scope_id.clone(),
                    version_id: *version_id,
                })
                .await?;
        }
        let holders: HashSet<String> = cached
            .iter()
            .map(|v| v.worker.clone())
            .chain(req.preferred_workers.iter().cloned())
            .collect();

        let worker = select_worker(&workers, req, &holders)?.clone();
        let container = Container {
            id: ContainerId::new(),
            worker: worker.name.clone(),
            build_id,
            plan_id,
            state: ContainerState::Created,
            created_at: Utc::now(),
        };
        self.repo.create_container(&container).await?;

        debug!(
            worker = %worker.name,
            container_id = %container.id,
            preferred = holders.contains(&worker.name),
            "Step placed"
        );

        let volumes = cached.into_iter().filter(|v| v.worker == worker.name).collect();
        Ok(Placement {
            worker,
            container,
            volumes,
        })
    }

    /// Create a volume on a worker, owned by `container` when given.
    pub async fn create_volume(
        &self,
        worker: &Worker,
        kind: VolumeKind,
        container: Option<ContainerId>,
    ) -> Result<Volume> {
        let volume = Volume {
            id: VolumeId::new(),
            worker: worker.name.clone(),
            kind,
            container_id: container,
            created_at: Utc::now(),
        };
        self.repo.create_volume(&volume).await?;
        if let Err(e) = self.runtime.create_volume(worker, &volume).await {
            self.repo.delete_volume(volume.id).await?;
            return Err(e);
        }
        Ok(volume)
    }

    /// Destroy a container and the volumes it owns, then finish draining
    /// its worker if this was the last one.
    pub async fn release(&self, container: &Container) -> Result<()> {
        let worker = match self.repo.get_worker(&container.worker).await? {
            Some(worker) => worker,
            // Pruned while the step ran; its records are already gone.
            None => return Ok(()),
        };

        self.repo
            .set_container_state(container.id, ContainerState::Destroying)
            .await?;
        let owned: Vec<Volume> = self
            .repo
            .list_volumes(Some(&worker.name))
            .await?
            .into_iter()
            .filter(|v| v.container_id == Some(container.id))
            .collect();

        if worker.state != WorkerState::Stalled {
            for volume in &owned {
                if let Err(e) = self.runtime.destroy_volume(&worker, volume.id).await {
                    warn!(worker = %worker.name, volume_id = %volume.id, error = %e, "Failed to destroy volume");
                }
            }
            if let Err(e) = self.runtime.destroy_container(&worker, container.id).await {
                warn!(worker = %worker.name, container_id = %container.id, error = %e, "Failed to destroy container");
            }
        }
        self.repo.delete_container(container.id).await?;
        self.settle(&worker.name).await?;
        Ok(())
    }

    /// Destroy a volume that no container owns.
    pub async fn destroy_volume(&self, volume: &Volume) -> Result<()> {
        if let Some(worker) = self.repo.get_worker(&volume.worker).await? {
            if worker.state != WorkerState::Stalled {
                if let Err(e) = self.runtime.destroy_volume(&worker, volume.id).await {
                    warn!(worker = %worker.name, volume_id = %volume.id, error = %e, "Failed to destroy volume");
                }
            }
        }
        self.repo.delete_volume(volume.id).await
    }

    /// A cached fetch of `req.cached_version` on a worker that may run a step
    /// with these requirements, if any.
    pub async fn find_resource_cache(
        &self,
        req: &StepRequirements,
    ) -> Result<Option<(Worker, Volume)>> {
        let Some((scope_id, version_id)) = &req.cached_version else {
            return Ok(None);
        };
        let volumes = self
            .repo
            .find_cache_volumes(&VolumeKind::ResourceCache {
                scope_id: scope_id.clone(),
                version_id: *version_id,
            })
            .await?;
        for volume in volumes {
            if let Some(worker) = self.repo.get_worker(&volume.worker).await? {
                if eligible(&worker, req) {
                    return Ok(Some((worker, volume)));
                }
            }
        }
        Ok(None)
    }

    /// A task cache volume with this key on the given worker.
    pub async fn find_task_cache(&self, worker: &str, key: &str) -> Result<Option<Volume>> {
        let volumes = self
            .repo
            .find_cache_volumes(&VolumeKind::TaskCache {
                key: key.to_string(),
            })
            .await?;
        Ok(volumes.into_iter().find(|v| v.worker == worker))
    }

    /// Mark workers whose heartbeat expired as stalled and signal their loss.
    /// Returns the names of newly stalled workers.
    pub async fn sweep_stalled(&self) -> Result<Vec<String>> {
        let ttl = chrono::Duration::from_std(self.config.heartbeat_ttl)
            .map_err(|e| Error::Internal(format!("invalid heartbeat ttl: {e}")))?;
        let deadline = Utc::now() - ttl;

        let mut stalled = Vec::new();
        for worker in self.repo.list_workers().await? {
            let live = matches!(
                worker.state,
                WorkerState::Running | WorkerState::Landing | WorkerState::Retiring
            );
            if live && worker.last_heartbeat < deadline {
                self.repo
                    .set_worker_state(&worker.name, WorkerState::Stalled)
                    .await?;
                if let Some(token) = self.lost.get(&worker.name) {
                    token.cancel();
                }
                warn!(
                    worker = %worker.name,
                    last_heartbeat = %worker.last_heartbeat,
                    "Worker stalled"
                );
                stalled.push(worker.name);
            }
        }
        Ok(stalled)
    }

    /// Fires when the worker is marked stalled or removed.
    pub fn lost_signal(&self, worker: &str) -> CancellationToken {
        self.lost
            .entry(worker.to_string())
            .or_default()
            .clone()
    }

    /// Sweep for stalled workers until `shutdown` fires.
    pub async fn run_sweeper(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!(interval_secs = interval.as_secs(), "Starting stalled worker sweeper");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stalled().await {
                        warn!(error = %e, "Stalled worker sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Stalled worker sweeper shutting down");
                    break;
                }
            }
        }
    }

    fn reset_lost_signal(&self, name: &str) {
        let mut entry = self.lost.entry(name.to_string()).or_default();
        if entry.is_cancelled() {
            *entry = CancellationToken::new();
        }
    }

    /// Complete a drain once a worker has no containers left.
    /// Returns `true` if the worker was removed.
    async fn settle(&self, name: &str) -> Result<bool> {
        let Some(worker) = self.repo.get_worker(name).await? else {
            return Ok(false);
        };
        if worker.active_containers > 0 {
            return Ok(false);
        }
        match worker.state {
            WorkerState::Landing => {
                self.repo.set_worker_state(name, WorkerState::Landed).await?;
                info!(worker = %name, "Worker landed");
                Ok(false)
            }
            WorkerState::Retiring => {
                self.remove(name).await?;
                info!(worker = %name, "Worker retired");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.repo.delete_worker(name).await?;
        if let Some((_, token)) = self.lost.remove(name) {
            token.cancel();
        }
        Ok(())
    }
}
