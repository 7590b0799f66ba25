//! Leaf steps: get, put and task.
//!
//! A leaf reports `initialize`, `selected-worker`, `start`, its output and
//! `finish`. A process that runs and exits nonzero is Failed; anything that
//! keeps it from running or finishing is Errored; cancellation is Aborted.

use crate::exec::{Artifact, BuildRun};
use conveyor_core::build::{BuildOutput, BuildStatus};
use conveyor_core::events::{
    EventOrigin, EventPayload, FinishPayload, InitializePayload, LogPayload,
    SelectedWorkerPayload, StartPayload,
};
use conveyor_core::ids::PlanId;
use conveyor_core::pipeline::TaskInput;
use conveyor_core::plan::{GetPlan, PutPlan, TaskPlan};
use conveyor_core::ports::{
    Mount, MountRole, OutputChunk, ProcessAction, ProcessOutcome, ProcessSpec,
};
use conveyor_core::version::{MetadataField, Version};
use conveyor_core::worker::{Container, StepRequirements, Volume, VolumeKind, Worker};
use conveyor_core::{Error, Result};
use conveyor_workers::Placement;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a leaf step ended, as reported in its `finish` event.
struct LeafOutcome {
    status: BuildStatus,
    exit_status: Option<i32>,
    version: Option<Version>,
    metadata: Vec<MetadataField>,
}

impl LeafOutcome {
    fn exited(outcome: ProcessOutcome) -> Self {
        Self {
            status: if outcome.succeeded() {
                BuildStatus::Succeeded
            } else {
                BuildStatus::Failed
            },
            exit_status: Some(outcome.exit_status),
            version: outcome.version,
            metadata: outcome.metadata,
        }
    }
}

impl BuildRun {
    pub(crate) async fn run_get(
        self: Arc<Self>,
        id: PlanId,
        get: GetPlan,
        cancel: CancellationToken,
    ) -> BuildStatus {
        let origin = self.initialize(&id, &get.name, "get").await;
        let result = self.get(&id, &origin, &get, &cancel).await;
        self.conclude(origin, result, &cancel).await
    }

    pub(crate) async fn run_put(
        self: Arc<Self>,
        id: PlanId,
        put: PutPlan,
        cancel: CancellationToken,
    ) -> BuildStatus {
        let origin = self.initialize(&id, &put.name, "put").await;
        let result = self.put(&id, &origin, &put, &cancel).await;
        self.conclude(origin, result, &cancel).await
    }

    pub(crate) async fn run_task(
        self: Arc<Self>,
        id: PlanId,
        task: TaskPlan,
        cancel: CancellationToken,
    ) -> BuildStatus {
        let origin = self.initialize(&id, &task.name, "task").await;
        let result = self.task(&id, &origin, &task, &cancel).await;
        self.conclude(origin, result, &cancel).await
    }

    async fn initialize(&self, id: &PlanId, name: &str, kind: &str) -> EventOrigin {
        let origin = EventOrigin::new(id.clone(), Some(name.to_string()));
        self.emit(EventPayload::Initialize(InitializePayload {
            origin: origin.clone(),
            kind: kind.to_string(),
        }))
        .await;
        origin
    }

    async fn conclude(
        &self,
        origin: EventOrigin,
        result: Result<LeafOutcome>,
        cancel: &CancellationToken,
    ) -> BuildStatus {
        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                if !cancel.is_cancelled() {
                    self.emit(EventPayload::error(Some(origin.clone()), e.to_string()))
                        .await;
                }
                LeafOutcome {
                    status: BuildStatus::Errored,
                    exit_status: None,
                    version: None,
                    metadata: Vec::new(),
                }
            }
        };
        if cancel.is_cancelled() {
            outcome.status = BuildStatus::Aborted;
        }

        self.emit(EventPayload::Finish(FinishPayload {
            origin,
            status: outcome.status,
            exit_status: outcome.exit_status,
            version: outcome.version,
            metadata: outcome.metadata,
        }))
        .await;
        outcome.status
    }

    async fn get(
        self: &Arc<Self>,
        id: &PlanId,
        origin: &EventOrigin,
        get: &GetPlan,
        cancel: &CancellationToken,
    ) -> Result<LeafOutcome> {
        let req = StepRequirements {
            team: self.build.team.clone(),
            tags: get.tags.clone(),
            resource_type: get.image.base_type().map(str::to_string),
            cached_version: Some((get.scope_id.clone(), get.version_id)),
            ..Default::default()
        };
        if let Some((worker, volume)) = self.pool.find_resource_cache(&req).await? {
            debug!(build_id = %self.build.id, step = %get.name, worker = %worker.name, "Reusing cached fetch");
            self.selected(origin, &worker).await;
            return Ok(self.reuse(origin, get, worker, volume).await);
        }

        let placement = self.place(id, origin, &req).await?;
        let result = self.fetch(origin, &placement, get, cancel).await;
        self.release(&placement.container).await;
        result
    }

    async fn fetch(
        self: &Arc<Self>,
        origin: &EventOrigin,
        placement: &Placement,
        get: &GetPlan,
        cancel: &CancellationToken,
    ) -> Result<LeafOutcome> {
        // Someone fetched the version onto this worker in the meantime.
        if let Some(volume) = placement.volumes.first() {
            return Ok(self
                .reuse(origin, get, placement.worker.clone(), volume.clone())
                .await);
        }

        let volume = self
            .pool
            .create_volume(
                &placement.worker,
                VolumeKind::ResourceCache {
                    scope_id: get.scope_id.clone(),
                    version_id: get.version_id,
                },
                None,
            )
            .await?;
        let spec = ProcessSpec {
            container_id: placement.container.id,
            image: get.image.clone(),
            action: ProcessAction::Get {
                resource_type: get.resource_type.clone(),
                source: get.source.clone(),
                version: get.version.clone(),
                params: get.params.clone(),
            },
            mounts: vec![Mount {
                name: get.name.clone(),
                volume: volume.id,
                path: get.name.clone(),
                role: MountRole::Fetched,
            }],
            env: BTreeMap::new(),
        };

        let outcome = match self.run_process(origin, &placement.worker, spec, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.discard(&volume).await;
                return Err(e);
            }
        };
        if !outcome.succeeded() || cancel.is_cancelled() {
            // A partial fetch must never be reused as a cache.
            self.discard(&volume).await;
            return Ok(LeafOutcome::exited(outcome));
        }

        self.register(
            &get.name,
            Artifact {
                worker: placement.worker.name.clone(),
                volume,
            },
        )
        .await;
        Ok(LeafOutcome {
            status: BuildStatus::Succeeded,
            exit_status: Some(outcome.exit_status),
            version: Some(get.version.clone()),
            metadata: outcome.metadata,
        })
    }

    async fn reuse(&self, origin: &EventOrigin, get: &GetPlan, worker: Worker, volume: Volume) -> LeafOutcome {
        self.emit(EventPayload::Start(StartPayload {
            origin: origin.clone(),
        }))
        .await;
        self.register(
            &get.name,
            Artifact {
                worker: worker.name,
                volume,
            },
        )
        .await;
        LeafOutcome {
            status: BuildStatus::Succeeded,
            exit_status: Some(0),
            version: Some(get.version.clone()),
            metadata: Vec::new(),
        }
    }

    async fn put(
        self: &Arc<Self>,
        id: &PlanId,
        origin: &EventOrigin,
        put: &PutPlan,
        cancel: &CancellationToken,
    ) -> Result<LeafOutcome> {
        let inputs: Vec<(String, Artifact)> = match &put.inputs {
            Some(names) => self
                .all_artifacts()
                .await
                .into_iter()
                .filter(|(name, _)| names.contains(name))
                .collect(),
            None => self.all_artifacts().await,
        };
        let req = StepRequirements {
            team: self.build.team.clone(),
            tags: put.tags.clone(),
            resource_type: put.image.base_type().map(str::to_string),
            preferred_workers: inputs.iter().map(|(_, a)| a.worker.clone()).collect(),
            ..Default::default()
        };
        let placement = self.place(id, origin, &req).await?;
        let result = self.push(origin, &placement, put, inputs, cancel).await;
        self.release(&placement.container).await;
        result
    }

    async fn push(
        self: &Arc<Self>,
        origin: &EventOrigin,
        placement: &Placement,
        put: &PutPlan,
        inputs: Vec<(String, Artifact)>,
        cancel: &CancellationToken,
    ) -> Result<LeafOutcome> {
        let mut mounts = Vec::with_capacity(inputs.len());
        for (name, artifact) in inputs {
            mounts.push(input_mount(&placement.worker, name.clone(), name, &artifact)?);
        }
        let spec = ProcessSpec {
            container_id: placement.container.id,
            image: put.image.clone(),
            action: ProcessAction::Put {
                resource_type: put.resource_type.clone(),
                source: put.source.clone(),
                params: put.params.clone(),
            },
            mounts,
            env: BTreeMap::new(),
        };

        let outcome = self.run_process(origin, &placement.worker, spec, cancel).await?;
        if !outcome.succeeded() || cancel.is_cancelled() {
            return Ok(LeafOutcome::exited(outcome));
        }

        let version = outcome
            .version
            .clone()
            .ok_or_else(|| Error::Execution(format!("put {} reported no version", put.name)))?;
        let scope = self.versions.find_or_create_scope(&put.scope).await?;
        let row = self
            .versions
            .save_version(&scope.id, &version, &outcome.metadata)
            .await?;
        if !self.build.is_one_off() {
            self.builds
                .save_output(
                    self.build.id,
                    &BuildOutput {
                        name: put.name.clone(),
                        resource: put.resource.clone(),
                        version_id: row.id,
                    },
                )
                .await?;
        }
        Ok(LeafOutcome::exited(outcome))
    }

    async fn task(
        self: &Arc<Self>,
        id: &PlanId,
        origin: &EventOrigin,
        task: &TaskPlan,
        cancel: &CancellationToken,
    ) -> Result<LeafOutcome> {
        let mut inputs = Vec::new();
        for input in &task.config.inputs {
            match self.artifact(&input.name).await {
                Some(artifact) => inputs.push((input, artifact)),
                None if input.optional => {}
                None => {
                    return Err(Error::Execution(format!(
                        "task {} is missing input {}",
                        task.name, input.name
                    )));
                }
            }
        }

        let req = StepRequirements {
            team: self.build.team.clone(),
            platform: Some(task.config.platform.clone()),
            tags: task.tags.clone(),
            resource_type: task.image.base_type().map(str::to_string),
            preferred_workers: inputs.iter().map(|(_, a)| a.worker.clone()).collect(),
            ..Default::default()
        };
        let placement = self.place(id, origin, &req).await?;
        let result = self.execute_task(origin, &placement, task, inputs, cancel).await;
        self.release(&placement.container).await;
        result
    }

    async fn execute_task(
        self: &Arc<Self>,
        origin: &EventOrigin,
        placement: &Placement,
        task: &TaskPlan,
        inputs: Vec<(&TaskInput, Artifact)>,
        cancel: &CancellationToken,
    ) -> Result<LeafOutcome> {
        let worker = &placement.worker;
        let mut mounts = Vec::new();
        for (input, artifact) in inputs {
            let path = input.path.clone().unwrap_or_else(|| input.name.clone());
            mounts.push(input_mount(worker, input.name.clone(), path, &artifact)?);
        }

        let mut outputs = Vec::new();
        for output in &task.config.outputs {
            let volume = self
                .pool
                .create_volume(worker, VolumeKind::Container, None)
                .await?;
            self.track_scratch(volume.clone()).await;
            mounts.push(Mount {
                name: output.name.clone(),
                volume: volume.id,
                path: output.path.clone().unwrap_or_else(|| output.name.clone()),
                role: MountRole::Output,
            });
            outputs.push((output.name.clone(), volume));
        }

        for cache in &task.config.caches {
            let volume = match task.cache_key(&cache.path) {
                Some(key) => match self.pool.find_task_cache(&worker.name, &key).await? {
                    Some(volume) => volume,
                    None => {
                        self.pool
                            .create_volume(worker, VolumeKind::TaskCache { key }, None)
                            .await?
                    }
                },
                // Without a job there is nothing to share the cache with.
                None => {
                    self.pool
                        .create_volume(worker, VolumeKind::Container, Some(placement.container.id))
                        .await?
                }
            };
            mounts.push(Mount {
                name: cache.path.clone(),
                volume: volume.id,
                path: cache.path.clone(),
                role: MountRole::Cache,
            });
        }

        let spec = ProcessSpec {
            container_id: placement.container.id,
            image: task.image.clone(),
            action: ProcessAction::Task {
                run: task.config.run.clone(),
            },
            mounts,
            env: task.params.clone(),
        };
        let outcome = self.run_process(origin, worker, spec, cancel).await?;
        if outcome.succeeded() {
            for (name, volume) in outputs {
                self.register(
                    &name,
                    Artifact {
                        worker: worker.name.clone(),
                        volume,
                    },
                )
                .await;
            }
        }
        Ok(LeafOutcome::exited(outcome))
    }

    async fn place(
        &self,
        id: &PlanId,
        origin: &EventOrigin,
        req: &StepRequirements,
    ) -> Result<Placement> {
        let placement = self
            .pool
            .place(req, Some(self.build.id), Some(id.clone()))
            .await?;
        self.selected(origin, &placement.worker).await;
        Ok(placement)
    }

    async fn selected(&self, origin: &EventOrigin, worker: &Worker) {
        self.emit(EventPayload::SelectedWorker(SelectedWorkerPayload {
            origin: origin.clone(),
            worker: worker.name.clone(),
        }))
        .await;
    }

    /// Run a process, forwarding its output as log events. Losing the
    /// worker ends the step with an error.
    async fn run_process(
        self: &Arc<Self>,
        origin: &EventOrigin,
        worker: &Worker,
        spec: ProcessSpec,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome> {
        self.emit(EventPayload::Start(StartPayload {
            origin: origin.clone(),
        }))
        .await;

        let (tx, mut rx) = mpsc::channel::<OutputChunk>(self.output_buffer);
        let forwarder = {
            let run = self.clone();
            let origin = origin.clone();
            tokio::spawn(async move {
                while let Some(chunk) = rx.recv().await {
                    run.emit(EventPayload::Log(LogPayload {
                        origin: origin.clone(),
                        stream: chunk.stream,
                        payload: chunk.line,
                    }))
                    .await;
                }
            })
        };

        let lost = self.pool.lost_signal(&worker.name);
        let process_cancel = cancel.child_token();
        let runtime = self.pool.runtime().clone();
        let result = tokio::select! {
            result = runtime.run(worker, spec, tx, process_cancel.clone()) => result,
            _ = lost.cancelled() => {
                process_cancel.cancel();
                Err(Error::WorkerLost(worker.name.clone()))
            }
        };

        // Logs land before the step's finish event.
        if let Err(e) = forwarder.await {
            warn!(build_id = %self.build.id, error = %e, "Log forwarder failed");
        }
        result
    }

    async fn release(&self, container: &Container) {
        if let Err(e) = self.pool.release(container).await {
            warn!(build_id = %self.build.id, container_id = %container.id, error = %e, "Failed to release container");
        }
    }

    async fn discard(&self, volume: &Volume) {
        if let Err(e) = self.pool.destroy_volume(volume).await {
            warn!(build_id = %self.build.id, volume_id = %volume.id, error = %e, "Failed to destroy volume");
        }
    }
}

/// Mount an earlier artifact, which must live on the step's worker.
fn input_mount(worker: &Worker, name: String, path: String, artifact: &Artifact) -> Result<Mount> {
    if artifact.worker != worker.name {
        return Err(Error::Execution(format!(
            "artifact {name} is on worker {}, step was placed on {}",
            artifact.worker, worker.name
        )));
    }
    Ok(Mount {
        name,
        volume: artifact.volume.id,
        path,
        role: MountRole::Input,
    })
}
