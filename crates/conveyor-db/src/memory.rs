//! In-memory implementation of every storage port.
//!
//! Used for ephemeral servers (`--in-memory`) and as the fixture store in
//! tests. All state lives behind one async lock so multi-table operations are
//! atomic just like their transactional PostgreSQL counterparts.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::build::{Build, BuildInput, BuildOutput, BuildStatus, BuildVersions, NewBuild};
use conveyor_core::events::{BuildEvent, EventPayload};
use conveyor_core::ids::*;
use conveyor_core::lock::LockId;
use conveyor_core::pipeline::{CheckableKind, JobState, Pipeline, PipelineConfig, ResourceState};
use conveyor_core::ports::*;
use conveyor_core::version::{
    version_digest, MetadataField, ResourceScope, ResourceVersion, ScopeSpec, Version,
};
use conveyor_core::worker::{Container, ContainerState, Volume, VolumeKind, Worker, WorkerState};
use conveyor_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

type ResourceKey = (PipelineId, CheckableKind, String);

#[derive(Default)]
struct State {
    pipelines: HashMap<PipelineId, Pipeline>,
    jobs: HashMap<(PipelineId, String), JobState>,
    resources: HashMap<ResourceKey, ResourceState>,

    scopes: HashMap<ScopeId, ResourceScope>,
    /// Versions per scope in insertion order.
    versions: HashMap<ScopeId, Vec<ResourceVersion>>,
    version_scopes: HashMap<VersionId, ScopeId>,
    check_orders: HashMap<ScopeId, i64>,

    builds: HashMap<BuildId, Build>,
    build_order: Vec<BuildId>,
    build_inputs: HashMap<BuildId, Vec<BuildInput>>,
    build_outputs: HashMap<BuildId, Vec<BuildOutput>>,

    events: HashMap<BuildId, Vec<BuildEvent>>,
    completed: HashSet<BuildId>,

    workers: BTreeMap<String, Worker>,
    containers: HashMap<ContainerId, Container>,
    volumes: HashMap<VolumeId, Volume>,
}

impl State {
    fn sync_runtime_state(&mut self, pipeline_id: PipelineId, config: &PipelineConfig) {
        let job_names: HashSet<&str> = config.jobs.iter().map(|j| j.name.as_str()).collect();
        self.jobs
            .retain(|(pid, name), _| *pid != pipeline_id || job_names.contains(name.as_str()));
        for job in &config.jobs {
            self.jobs
                .entry((pipeline_id, job.name.clone()))
                .or_insert_with(|| JobState {
                    pipeline_id,
                    name: job.name.clone(),
                    paused: false,
                    pending_triggers: 0,
                    build_number_seq: 0,
                });
        }

        let wanted: HashSet<(CheckableKind, &str)> = config
            .resources
            .iter()
            .map(|r| (CheckableKind::Resource, r.name.as_str()))
            .chain(
                config
                    .resource_types
                    .iter()
                    .map(|t| (CheckableKind::ResourceType, t.name.as_str())),
            )
            .collect();
        self.resources.retain(|(pid, kind, name), _| {
            *pid != pipeline_id || wanted.contains(&(*kind, name.as_str()))
        });
        for (kind, name) in wanted {
            self.resources
                .entry((pipeline_id, kind, name.to_string()))
                .or_insert_with(|| ResourceState {
                    pipeline_id,
                    kind,
                    name: name.to_string(),
                    scope_id: None,
                    pinned_version: None,
                    pin_comment: None,
                    check_error: None,
                });
        }
    }

    fn job_mut(&mut self, pipeline_id: PipelineId, job: &str) -> Result<&mut JobState> {
        self.jobs
            .get_mut(&(pipeline_id, job.to_string()))
            .ok_or_else(|| Error::JobNotFound(job.to_string()))
    }

    fn resource_mut(
        &mut self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
    ) -> Result<&mut ResourceState> {
        self.resources
            .get_mut(&(pipeline_id, kind, name.to_string()))
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))
    }

    fn insert_version(
        &mut self,
        scope: &ScopeId,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<(ResourceVersion, bool)> {
        if !self.scopes.contains_key(scope) {
            return Err(Error::ScopeNotFound(scope.to_string()));
        }
        let digest = version_digest(version);
        let history = self.versions.entry(scope.clone()).or_default();
        if let Some(existing) = history.iter().find(|v| v.digest == digest) {
            return Ok((existing.clone(), false));
        }

        let order = self.check_orders.entry(scope.clone()).or_insert(0);
        *order += 1;
        let row = ResourceVersion {
            id: VersionId::new(),
            scope_id: scope.clone(),
            version: version.clone(),
            digest,
            metadata: metadata.to_vec(),
            check_order: *order,
            enabled: true,
            created_at: Utc::now(),
        };
        history.push(row.clone());
        self.version_scopes.insert(row.id, scope.clone());
        Ok((row, true))
    }

    fn job_builds(&self, pipeline_id: PipelineId, job: &str) -> impl Iterator<Item = &Build> {
        self.build_order
            .iter()
            .rev()
            .filter_map(|id| self.builds.get(id))
            .filter(move |b| b.pipeline_id == Some(pipeline_id) && b.job.as_deref() == Some(job))
    }

    fn worker_with_load(&self, worker: &Worker) -> Worker {
        let mut worker = worker.clone();
        worker.active_containers = self
            .containers
            .values()
            .filter(|c| c.worker == worker.name)
            .count() as u32;
        worker
    }
}

/// Every storage port backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineRepository for MemoryStore {
    async fn save(
        &self,
        team: &str,
        name: &str,
        config: &PipelineConfig,
        expected_version: Option<i64>,
    ) -> Result<Pipeline> {
        config.validate()?;
        let mut state = self.state.write().await;
        let now = Utc::now();

        let existing = state
            .pipelines
            .values()
            .find(|p| p.team == team && p.name == name)
            .map(|p| p.id);

        let pipeline = match existing {
            Some(id) => {
                let pipeline = state
                    .pipelines
                    .get_mut(&id)
                    .ok_or_else(|| Error::PipelineNotFound(name.to_string()))?;
                if let Some(expected) = expected_version {
                    if expected != pipeline.config_version {
                        return Err(Error::ConfigConflict {
                            expected,
                            found: pipeline.config_version,
                        });
                    }
                }
                pipeline.config = config.clone();
                pipeline.config_version += 1;
                pipeline.archived = false;
                pipeline.updated_at = now;
                pipeline.clone()
            }
            None => {
                if let Some(expected) = expected_version.filter(|v| *v != 0) {
                    return Err(Error::ConfigConflict { expected, found: 0 });
                }
                let pipeline = Pipeline {
                    id: PipelineId::new(),
                    team: team.to_string(),
                    name: name.to_string(),
                    config: config.clone(),
                    config_version: 1,
                    paused: false,
                    archived: false,
                    created_at: now,
                    updated_at: now,
                };
                state.pipelines.insert(pipeline.id, pipeline.clone());
                pipeline
            }
        };

        state.sync_runtime_state(pipeline.id, config);
        Ok(pipeline)
    }

    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.state.read().await.pipelines.get(&id).cloned())
    }

    async fn find(&self, team: &str, name: &str) -> Result<Option<Pipeline>> {
        let state = self.state.read().await;
        Ok(state
            .pipelines
            .values()
            .find(|p| p.team == team && p.name == name)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Pipeline>> {
        let state = self.state.read().await;
        let mut pipelines: Vec<_> = state.pipelines.values().cloned().collect();
        pipelines.sort_by(|a, b| (&a.team, &a.name).cmp(&(&b.team, &b.name)));
        Ok(pipelines)
    }

    async fn set_paused(&self, id: PipelineId, paused: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        pipeline.paused = paused;
        pipeline.updated_at = Utc::now();
        Ok(())
    }

    async fn archive(&self, id: PipelineId) -> Result<()> {
        let mut state = self.state.write().await;
        let pipeline = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
        pipeline.archived = true;
        pipeline.paused = true;
        pipeline.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: PipelineId) -> Result<()> {
        let mut state = self.state.write().await;
        if state.pipelines.remove(&id).is_none() {
            return Err(Error::PipelineNotFound(id.to_string()));
        }
        state.jobs.retain(|(pid, _), _| *pid != id);
        state.resources.retain(|(pid, _, _), _| *pid != id);
        let doomed: HashSet<BuildId> = state
            .builds
            .values()
            .filter(|b| b.pipeline_id == Some(id))
            .map(|b| b.id)
            .collect();
        state.builds.retain(|bid, _| !doomed.contains(bid));
        state.build_order.retain(|bid| !doomed.contains(bid));
        state.build_inputs.retain(|bid, _| !doomed.contains(bid));
        state.build_outputs.retain(|bid, _| !doomed.contains(bid));
        state.events.retain(|bid, _| !doomed.contains(bid));
        state.completed.retain(|bid| !doomed.contains(bid));
        Ok(())
    }

    async fn job_state(&self, pipeline_id: PipelineId, job: &str) -> Result<Option<JobState>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(&(pipeline_id, job.to_string())).cloned())
    }

    async fn set_job_paused(&self, pipeline_id: PipelineId, job: &str, paused: bool) -> Result<()> {
        let mut state = self.state.write().await;
        state.job_mut(pipeline_id, job)?.paused = paused;
        Ok(())
    }

    async fn request_trigger(&self, pipeline_id: PipelineId, job: &str) -> Result<u32> {
        let mut state = self.state.write().await;
        let job = state.job_mut(pipeline_id, job)?;
        job.pending_triggers += 1;
        Ok(job.pending_triggers)
    }

    async fn take_trigger_request(&self, pipeline_id: PipelineId, job: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.job_mut(pipeline_id, job)?;
        if job.pending_triggers == 0 {
            return Ok(false);
        }
        job.pending_triggers -= 1;
        Ok(true)
    }

    async fn resource_state(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
    ) -> Result<Option<ResourceState>> {
        let state = self.state.read().await;
        Ok(state
            .resources
            .get(&(pipeline_id, kind, name.to_string()))
            .cloned())
    }

    async fn resource_states(&self, pipeline_id: PipelineId) -> Result<Vec<ResourceState>> {
        let state = self.state.read().await;
        let mut states: Vec<_> = state
            .resources
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| (a.kind.as_str(), &a.name).cmp(&(b.kind.as_str(), &b.name)));
        Ok(states)
    }

    async fn set_resource_scope(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
        scope_id: Option<&ScopeId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.resource_mut(pipeline_id, kind, name)?.scope_id = scope_id.cloned();
        Ok(())
    }

    async fn set_resource_check_error(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.resource_mut(pipeline_id, kind, name)?.check_error = error.map(str::to_string);
        Ok(())
    }

    async fn pin_version(
        &self,
        pipeline_id: PipelineId,
        resource: &str,
        version_id: Option<VersionId>,
        comment: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(id) = version_id {
            if !state.version_scopes.contains_key(&id) {
                return Err(Error::VersionNotFound(id.to_string()));
            }
        }
        let res = state.resource_mut(pipeline_id, CheckableKind::Resource, resource)?;
        res.pinned_version = version_id;
        res.pin_comment = version_id.and(comment.map(str::to_string));
        Ok(())
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn find_or_create_scope(&self, spec: &ScopeSpec) -> Result<ResourceScope> {
        let id = spec.id();
        let mut state = self.state.write().await;
        let scope = state.scopes.entry(id.clone()).or_insert_with(|| ResourceScope {
            id,
            spec: spec.clone(),
            last_check_started: None,
            last_check_finished: None,
            check_error: None,
        });
        Ok(scope.clone())
    }

    async fn get_scope(&self, id: &ScopeId) -> Result<Option<ResourceScope>> {
        Ok(self.state.read().await.scopes.get(id).cloned())
    }

    async fn save_versions(&self, scope: &ScopeId, versions: &[Version]) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut inserted = 0;
        for version in versions {
            if state.insert_version(scope, version, &[])?.1 {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn save_version(
        &self,
        scope: &ScopeId,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<ResourceVersion> {
        let mut state = self.state.write().await;
        Ok(state.insert_version(scope, version, metadata)?.0)
    }

    async fn versions(&self, scope: &ScopeId, limit: Option<usize>) -> Result<Vec<ResourceVersion>> {
        let state = self.state.read().await;
        let history = state.versions.get(scope).map(Vec::as_slice).unwrap_or_default();
        Ok(history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn latest_version(&self, scope: &ScopeId) -> Result<Option<ResourceVersion>> {
        let state = self.state.read().await;
        Ok(state.versions.get(scope).and_then(|h| h.last()).cloned())
    }

    async fn latest_enabled(&self, scope: &ScopeId) -> Result<Option<ResourceVersion>> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .get(scope)
            .and_then(|h| h.iter().rev().find(|v| v.enabled))
            .cloned())
    }

    async fn find_version(&self, scope: &ScopeId, version: &Version) -> Result<Option<ResourceVersion>> {
        let digest = version_digest(version);
        let state = self.state.read().await;
        Ok(state
            .versions
            .get(scope)
            .and_then(|h| h.iter().find(|v| v.digest == digest))
            .cloned())
    }

    async fn get_version(&self, id: VersionId) -> Result<Option<ResourceVersion>> {
        let state = self.state.read().await;
        Ok(state
            .version_scopes
            .get(&id)
            .and_then(|scope| state.versions.get(scope))
            .and_then(|h| h.iter().find(|v| v.id == id))
            .cloned())
    }

    async fn set_version_enabled(&self, id: VersionId, enabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let scope = state
            .version_scopes
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::VersionNotFound(id.to_string()))?;
        let version = state
            .versions
            .get_mut(&scope)
            .and_then(|h| h.iter_mut().find(|v| v.id == id))
            .ok_or_else(|| Error::VersionNotFound(id.to_string()))?;
        version.enabled = enabled;
        Ok(())
    }

    async fn clear_versions(&self, scope: &ScopeId) -> Result<u64> {
        let mut state = self.state.write().await;
        let removed = state.versions.remove(scope).unwrap_or_default();
        let ids: HashSet<VersionId> = removed.iter().map(|v| v.id).collect();
        state.version_scopes.retain(|id, _| !ids.contains(id));
        for res in state.resources.values_mut() {
            if res.pinned_version.is_some_and(|v| ids.contains(&v)) {
                res.pinned_version = None;
                res.pin_comment = None;
            }
        }
        for inputs in state.build_inputs.values_mut() {
            inputs.retain(|i| !ids.contains(&i.version_id));
        }
        for outputs in state.build_outputs.values_mut() {
            outputs.retain(|o| !ids.contains(&o.version_id));
        }
        Ok(ids.len() as u64)
    }

    async fn try_claim_check(&self, scope: &ScopeId, interval: Duration, immediate: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        let scope = state
            .scopes
            .get_mut(scope)
            .ok_or_else(|| Error::ScopeNotFound(scope.to_string()))?;
        let now = Utc::now();
        let due = match scope.last_check_started {
            None => true,
            Some(started) => {
                let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
                elapsed >= interval
            }
        };
        if !(due || immediate) {
            return Ok(false);
        }
        scope.last_check_started = Some(now);
        Ok(true)
    }

    async fn record_check_result(&self, scope: &ScopeId, error: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        let scope = state
            .scopes
            .get_mut(scope)
            .ok_or_else(|| Error::ScopeNotFound(scope.to_string()))?;
        scope.last_check_finished = Some(Utc::now());
        scope.check_error = error.map(str::to_string);
        Ok(())
    }
}

#[async_trait]
impl BuildRepository for MemoryStore {
    async fn create(&self, new: NewBuild) -> Result<Build> {
        let mut state = self.state.write().await;
        let number = match (new.pipeline_id, new.job.as_deref()) {
            (Some(pipeline_id), Some(job)) => {
                let job = state.job_mut(pipeline_id, job)?;
                job.build_number_seq += 1;
                Some(job.build_number_seq)
            }
            _ => None,
        };

        let build = Build {
            id: BuildId::new(),
            team: new.team,
            pipeline_id: new.pipeline_id,
            job: new.job,
            number,
            status: BuildStatus::Pending,
            plan: new.plan,
            manually_triggered: new.manually_triggered,
            abort_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        state.builds.insert(build.id, build.clone());
        state.build_order.push(build.id);
        state.build_inputs.insert(build.id, new.inputs);
        Ok(build)
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.state.read().await.builds.get(&id).cloned())
    }

    async fn list_for_job(&self, pipeline_id: PipelineId, job: &str, limit: usize) -> Result<Vec<Build>> {
        let state = self.state.read().await;
        Ok(state.job_builds(pipeline_id, job).take(limit).cloned().collect())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Build>> {
        let state = self.state.read().await;
        Ok(state
            .build_order
            .iter()
            .rev()
            .filter_map(|id| state.builds.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn active_for_job(&self, pipeline_id: PipelineId, job: &str) -> Result<Vec<Build>> {
        let state = self.state.read().await;
        Ok(state
            .job_builds(pipeline_id, job)
            .filter(|b| b.status.is_active())
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: BuildStatus) -> Result<Vec<Build>> {
        let state = self.state.read().await;
        Ok(state
            .build_order
            .iter()
            .filter_map(|id| state.builds.get(id))
            .filter(|b| b.status == status)
            .cloned()
            .collect())
    }

    async fn transition(&self, id: BuildId, from: BuildStatus, to: BuildStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;
        if build.status != from {
            return Ok(false);
        }
        build.status = to;
        let now = Utc::now();
        if to == BuildStatus::Started {
            build.started_at = Some(now);
        }
        if to.is_terminal() {
            build.finished_at = Some(now);
        }
        Ok(true)
    }

    async fn request_abort(&self, id: BuildId) -> Result<bool> {
        let mut state = self.state.write().await;
        let build = state
            .builds
            .get_mut(&id)
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;
        if build.status.is_terminal() {
            return Ok(false);
        }
        build.abort_requested = true;
        Ok(true)
    }

    async fn save_output(&self, id: BuildId, output: &BuildOutput) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.builds.contains_key(&id) {
            return Err(Error::BuildNotFound(id.to_string()));
        }
        let outputs = state.build_outputs.entry(id).or_default();
        if !outputs.contains(output) {
            outputs.push(output.clone());
        }
        Ok(())
    }

    async fn inputs(&self, id: BuildId) -> Result<Vec<BuildInput>> {
        let state = self.state.read().await;
        Ok(state.build_inputs.get(&id).cloned().unwrap_or_default())
    }

    async fn outputs(&self, id: BuildId) -> Result<Vec<BuildOutput>> {
        let state = self.state.read().await;
        Ok(state.build_outputs.get(&id).cloned().unwrap_or_default())
    }

    async fn succeeded_build_versions(&self, pipeline_id: PipelineId, job: &str) -> Result<Vec<BuildVersions>> {
        let state = self.state.read().await;
        Ok(state
            .job_builds(pipeline_id, job)
            .filter(|b| b.status == BuildStatus::Succeeded)
            .map(|b| {
                let inputs = state.build_inputs.get(&b.id).into_iter().flatten();
                let outputs = state.build_outputs.get(&b.id).into_iter().flatten();
                BuildVersions {
                    build_id: b.id,
                    versions: inputs
                        .map(|i| (i.resource.clone(), i.version_id))
                        .chain(outputs.map(|o| (o.resource.clone(), o.version_id)))
                        .collect(),
                }
            })
            .collect())
    }

    async fn version_used(
        &self,
        pipeline_id: PipelineId,
        job: &str,
        input: &str,
        version: VersionId,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.job_builds(pipeline_id, job).any(|b| {
            state
                .build_inputs
                .get(&b.id)
                .is_some_and(|inputs| inputs.iter().any(|i| i.name == input && i.version_id == version))
        }))
    }

    async fn last_used_version(&self, pipeline_id: PipelineId, job: &str, input: &str) -> Result<Option<VersionId>> {
        let state = self.state.read().await;
        Ok(state.job_builds(pipeline_id, job).find_map(|b| {
            state
                .build_inputs
                .get(&b.id)
                .and_then(|inputs| inputs.iter().find(|i| i.name == input))
                .map(|i| i.version_id)
        }))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, build_id: BuildId, payload: EventPayload) -> Result<BuildEvent> {
        let mut state = self.state.write().await;
        if state.completed.contains(&build_id) {
            return Err(Error::Internal(format!("event log of {build_id} is closed")));
        }
        let log = state.events.entry(build_id).or_default();
        let event = BuildEvent {
            build_id,
            id: log.len() as u64,
            at: Utc::now(),
            payload,
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn read(&self, build_id: BuildId, from: u64, limit: usize) -> Result<Vec<BuildEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .get(&build_id)
            .map(|log| log.iter().skip(from as usize).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_completed(&self, build_id: BuildId) -> Result<()> {
        self.state.write().await.completed.insert(build_id);
        Ok(())
    }

    async fn is_completed(&self, build_id: BuildId) -> Result<bool> {
        Ok(self.state.read().await.completed.contains(&build_id))
    }
}

#[async_trait]
impl WorkerRepository for MemoryStore {
    async fn save_worker(&self, worker: &Worker) -> Result<()> {
        let mut state = self.state.write().await;
        state.workers.insert(worker.name.clone(), worker.clone());
        Ok(())
    }

    async fn get_worker(&self, name: &str) -> Result<Option<Worker>> {
        let state = self.state.read().await;
        Ok(state.workers.get(name).map(|w| state.worker_with_load(w)))
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let state = self.state.read().await;
        Ok(state
            .workers
            .values()
            .map(|w| state.worker_with_load(w))
            .collect())
    }

    async fn set_worker_state(&self, name: &str, worker_state: WorkerState) -> Result<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(name)
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
        worker.state = worker_state;
        Ok(())
    }

    async fn heartbeat_worker(&self, name: &str, at: chrono::DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(name)
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
        worker.last_heartbeat = at;
        Ok(())
    }

    async fn delete_worker(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.workers.remove(name);
        state.containers.retain(|_, c| c.worker != name);
        state.volumes.retain(|_, v| v.worker != name);
        Ok(())
    }

    async fn create_container(&self, container: &Container) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.workers.contains_key(&container.worker) {
            return Err(Error::WorkerNotFound(container.worker.clone()));
        }
        state.containers.insert(container.id, container.clone());
        Ok(())
    }

    async fn set_container_state(&self, id: ContainerId, container_state: ContainerState) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        container.state = container_state;
        Ok(())
    }

    async fn delete_container(&self, id: ContainerId) -> Result<()> {
        let mut state = self.state.write().await;
        state.containers.remove(&id);
        state.volumes.retain(|_, v| v.container_id != Some(id));
        Ok(())
    }

    async fn list_containers(&self, worker: Option<&str>) -> Result<Vec<Container>> {
        let state = self.state.read().await;
        let mut containers: Vec<_> = state
            .containers
            .values()
            .filter(|c| worker.is_none_or(|w| c.worker == w))
            .cloned()
            .collect();
        containers.sort_by_key(|c| c.created_at);
        Ok(containers)
    }

    async fn create_volume(&self, volume: &Volume) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.workers.contains_key(&volume.worker) {
            return Err(Error::WorkerNotFound(volume.worker.clone()));
        }
        state.volumes.insert(volume.id, volume.clone());
        Ok(())
    }

    async fn list_volumes(&self, worker: Option<&str>) -> Result<Vec<Volume>> {
        let state = self.state.read().await;
        let mut volumes: Vec<_> = state
            .volumes
            .values()
            .filter(|v| worker.is_none_or(|w| v.worker == w))
            .cloned()
            .collect();
        volumes.sort_by_key(|v| v.created_at);
        Ok(volumes)
    }

    async fn find_cache_volumes(&self, kind: &VolumeKind) -> Result<Vec<Volume>> {
        let state = self.state.read().await;
        Ok(state
            .volumes
            .values()
            .filter(|v| &v.kind == kind)
            .cloned()
            .collect())
    }

    async fn delete_volume(&self, id: VolumeId) -> Result<()> {
        self.state.write().await.volumes.remove(&id);
        Ok(())
    }
}

/// Process-local locks.
#[derive(Clone, Default)]
pub struct MemoryLockFactory {
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl MemoryLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, id: &LockId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

struct MemoryLock {
    id: LockId,
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[async_trait]
impl Lock for MemoryLock {
    async fn release(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

#[async_trait]
impl LockFactory for MemoryLockFactory {
    async fn try_acquire(&self, id: &LockId) -> Result<Option<Box<dyn Lock>>> {
        let acquired = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLock {
            id: id.clone(),
            held: self.held.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::pipeline::{GetStep, JobConfig, ResourceConfig, StepConfig};
    use conveyor_core::version::Source;

    fn v(r: &str) -> Version {
        BTreeMap::from([("ref".to_string(), r.to_string())])
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            jobs: vec![JobConfig::new(
                "unit",
                vec![StepConfig::Get(GetStep::new("repo"))],
            )],
            resources: vec![ResourceConfig {
                name: "repo".into(),
                resource_type: "git".into(),
                source: Source::new(),
                check_every_secs: None,
                version: None,
                tags: vec![],
            }],
            resource_types: vec![],
        }
    }

    async fn scope(store: &MemoryStore) -> ScopeId {
        store
            .find_or_create_scope(&ScopeSpec::new("git", Source::new(), None))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_save_versions_preserves_discovery_order() {
        let store = MemoryStore::new();
        let scope = scope(&store).await;

        assert_eq!(store.save_versions(&scope, &[v("1"), v("2")]).await.unwrap(), 2);
        assert_eq!(store.save_versions(&scope, &[v("2"), v("3")]).await.unwrap(), 1);

        let refs: Vec<_> = store
            .versions(&scope, None)
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.version["ref"].clone())
            .collect();
        assert_eq!(refs, vec!["3", "2", "1"]);
    }

    #[tokio::test]
    async fn test_latest_enabled_skips_disabled() {
        let store = MemoryStore::new();
        let scope = scope(&store).await;
        store.save_versions(&scope, &[v("1"), v("2")]).await.unwrap();

        let latest = store.latest_enabled(&scope).await.unwrap().unwrap();
        store.set_version_enabled(latest.id, false).await.unwrap();

        let now = store.latest_enabled(&scope).await.unwrap().unwrap();
        assert_eq!(now.version, v("1"));
        assert_eq!(store.latest_version(&scope).await.unwrap().unwrap().version, v("2"));
    }

    #[tokio::test]
    async fn test_try_claim_check_respects_interval() {
        let store = MemoryStore::new();
        let scope = scope(&store).await;
        let hour = Duration::from_secs(3600);

        assert!(store.try_claim_check(&scope, hour, false).await.unwrap());
        assert!(!store.try_claim_check(&scope, hour, false).await.unwrap());
        assert!(store.try_claim_check(&scope, hour, true).await.unwrap());
        assert!(store.try_claim_check(&scope, Duration::ZERO, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_numbers_are_sequential() {
        let store = MemoryStore::new();
        let pipeline = store.save("main", "app", &config(), None).await.unwrap();

        let mut numbers = Vec::new();
        for _ in 0..3 {
            let build = BuildRepository::create(
                &store,
                NewBuild {
                    team: "main".into(),
                    pipeline_id: Some(pipeline.id),
                    job: Some("unit".into()),
                    plan: None,
                    inputs: vec![],
                    manually_triggered: false,
                },
            )
            .await
            .unwrap();
            numbers.push(build.number.unwrap());
        }
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = MemoryStore::new();
        let build = BuildRepository::create(
            &store,
            NewBuild {
                team: "main".into(),
                pipeline_id: None,
                job: None,
                plan: None,
                inputs: vec![],
                manually_triggered: true,
            },
        )
        .await
        .unwrap();

        assert!(store.transition(build.id, BuildStatus::Pending, BuildStatus::Started).await.unwrap());
        assert!(!store.transition(build.id, BuildStatus::Pending, BuildStatus::Started).await.unwrap());
        assert!(store.transition(build.id, BuildStatus::Started, BuildStatus::Failed).await.unwrap());
        assert!(!store.request_abort(build.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_rejects_stale_config_version() {
        let store = MemoryStore::new();
        let first = store.save("main", "app", &config(), None).await.unwrap();
        let second = store
            .save("main", "app", &config(), Some(first.config_version))
            .await
            .unwrap();
        assert_eq!(second.config_version, first.config_version + 1);

        let stale = store
            .save("main", "app", &config(), Some(first.config_version))
            .await;
        assert!(matches!(stale, Err(Error::ConfigConflict { .. })));
    }

    #[tokio::test]
    async fn test_clear_versions_unpins() {
        let store = MemoryStore::new();
        let pipeline = store.save("main", "app", &config(), None).await.unwrap();
        let scope = scope(&store).await;
        store.save_versions(&scope, &[v("1")]).await.unwrap();
        let version = store.latest_version(&scope).await.unwrap().unwrap();
        store
            .pin_version(pipeline.id, "repo", Some(version.id), Some("hold"))
            .await
            .unwrap();

        assert_eq!(store.clear_versions(&scope).await.unwrap(), 1);

        let state = store
            .resource_state(pipeline.id, CheckableKind::Resource, "repo")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.pinned_version, None);
        assert!(store.get_version(version.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_ids_are_contiguous() {
        let store = MemoryStore::new();
        let build_id = BuildId::new();
        for _ in 0..3 {
            store
                .append(build_id, EventPayload::status(BuildStatus::Started))
                .await
                .unwrap();
        }
        let ids: Vec<_> = store
            .read(build_id, 1, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let locks = MemoryLockFactory::new();
        let id = LockId::job(PipelineId::new(), "unit");

        let held = locks.try_acquire(&id).await.unwrap().unwrap();
        assert!(locks.try_acquire(&id).await.unwrap().is_none());
        held.release().await.unwrap();
        assert!(locks.try_acquire(&id).await.unwrap().is_some());
    }
}
