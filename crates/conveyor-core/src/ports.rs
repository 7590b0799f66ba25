//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the orchestration core and its
//! storage and execution adapters.

use crate::build::{Build, BuildInput, BuildOutput, BuildStatus, BuildVersions, NewBuild};
use crate::events::{BuildEvent, EventPayload, LogStream};
use crate::ids::*;
use crate::lock::LockId;
use crate::pipeline::{CheckableKind, JobState, Pipeline, PipelineConfig, ResourceState, TaskRun};
use crate::plan::ImageSpec;
use crate::version::{MetadataField, Params, ResourceScope, ResourceVersion, ScopeSpec, Source, Version};
use crate::worker::{Container, ContainerState, Volume, VolumeKind, Worker, WorkerState};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Stream of build events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<BuildEvent>> + Send>>;

/// Repository for pipelines and the runtime state of their jobs and resources.
#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Create or update a pipeline.
    ///
    /// When `expected_version` is set the save only succeeds if the stored
    /// config version still matches it.
    async fn save(
        &self,
        team: &str,
        name: &str,
        config: &PipelineConfig,
        expected_version: Option<i64>,
    ) -> Result<Pipeline>;

    /// Get a pipeline by ID.
    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    /// Get a pipeline by team and name.
    async fn find(&self, team: &str, name: &str) -> Result<Option<Pipeline>>;

    /// List all pipelines.
    async fn list(&self) -> Result<Vec<Pipeline>>;

    async fn set_paused(&self, id: PipelineId, paused: bool) -> Result<()>;

    /// Archive a pipeline. Archived pipelines are also paused.
    async fn archive(&self, id: PipelineId) -> Result<()>;

    /// Delete a pipeline with its jobs, resources and builds.
    async fn delete(&self, id: PipelineId) -> Result<()>;

    async fn job_state(&self, pipeline_id: PipelineId, job: &str) -> Result<Option<JobState>>;

    async fn set_job_paused(&self, pipeline_id: PipelineId, job: &str, paused: bool) -> Result<()>;

    /// Record a manual trigger to be served once the job is ready.
    /// Returns the number of pending requests.
    async fn request_trigger(&self, pipeline_id: PipelineId, job: &str) -> Result<u32>;

    /// Consume one pending trigger request, if any.
    async fn take_trigger_request(&self, pipeline_id: PipelineId, job: &str) -> Result<bool>;

    async fn resource_state(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
    ) -> Result<Option<ResourceState>>;

    async fn resource_states(&self, pipeline_id: PipelineId) -> Result<Vec<ResourceState>>;

    /// Point a resource or resource type at a scope.
    async fn set_resource_scope(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
        scope_id: Option<&ScopeId>,
    ) -> Result<()>;

    async fn set_resource_check_error(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
        error: Option<&str>,
    ) -> Result<()>;

    /// Pin (or unpin with `None`) a resource to a version through the API.
    async fn pin_version(
        &self,
        pipeline_id: PipelineId,
        resource: &str,
        version_id: Option<VersionId>,
        comment: Option<&str>,
    ) -> Result<()>;
}

/// Content-addressed version history, keyed by scope.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Get or create the scope for a configuration identity.
    async fn find_or_create_scope(&self, spec: &ScopeSpec) -> Result<ResourceScope>;

    async fn get_scope(&self, id: &ScopeId) -> Result<Option<ResourceScope>>;

    /// Insert versions in the given order. Known versions are skipped without
    /// changing their position. Returns the number inserted.
    async fn save_versions(&self, scope: &ScopeId, versions: &[Version]) -> Result<usize>;

    /// Insert a single version if absent and return the stored row.
    async fn save_version(
        &self,
        scope: &ScopeId,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<ResourceVersion>;

    /// Versions of a scope, newest first.
    async fn versions(&self, scope: &ScopeId, limit: Option<usize>) -> Result<Vec<ResourceVersion>>;

    /// Newest version regardless of enabled state.
    async fn latest_version(&self, scope: &ScopeId) -> Result<Option<ResourceVersion>>;

    /// Newest enabled version.
    async fn latest_enabled(&self, scope: &ScopeId) -> Result<Option<ResourceVersion>>;

    async fn find_version(&self, scope: &ScopeId, version: &Version) -> Result<Option<ResourceVersion>>;

    async fn get_version(&self, id: VersionId) -> Result<Option<ResourceVersion>>;

    async fn set_version_enabled(&self, id: VersionId, enabled: bool) -> Result<()>;

    /// Delete every version of a scope. Pins and build references to those
    /// versions go with them. Returns the number of versions removed.
    async fn clear_versions(&self, scope: &ScopeId) -> Result<u64>;

    /// Claim the right to check a scope now.
    ///
    /// Succeeds when the previous check started at least `interval` ago, or
    /// unconditionally when `immediate` is set. A successful claim records the
    /// check start time so concurrent claimers back off.
    async fn try_claim_check(&self, scope: &ScopeId, interval: Duration, immediate: bool) -> Result<bool>;

    /// Record the outcome of a check. `None` clears the previous error.
    async fn record_check_result(&self, scope: &ScopeId, error: Option<&str>) -> Result<()>;
}

/// Repository for builds and their input and output versions.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    /// Create a pending build. Job builds are numbered from the job's
    /// persisted sequence and have their inputs recorded atomically.
    async fn create(&self, build: NewBuild) -> Result<Build>;

    async fn get(&self, id: BuildId) -> Result<Option<Build>>;

    /// Builds of a job, newest first.
    async fn list_for_job(&self, pipeline_id: PipelineId, job: &str, limit: usize) -> Result<Vec<Build>>;

    /// Most recent builds across all jobs, newest first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<Build>>;

    /// Pending and started builds of a job.
    async fn active_for_job(&self, pipeline_id: PipelineId, job: &str) -> Result<Vec<Build>>;

    async fn list_by_status(&self, status: BuildStatus) -> Result<Vec<Build>>;

    /// Move a build from `from` to `to`. Returns `false` when the build is no
    /// longer in `from`, leaving it untouched.
    async fn transition(&self, id: BuildId, from: BuildStatus, to: BuildStatus) -> Result<bool>;

    /// Flag a non-terminal build for abort. Returns `false` if already terminal.
    async fn request_abort(&self, id: BuildId) -> Result<bool>;

    async fn save_output(&self, id: BuildId, output: &BuildOutput) -> Result<()>;

    async fn inputs(&self, id: BuildId) -> Result<Vec<BuildInput>>;

    async fn outputs(&self, id: BuildId) -> Result<Vec<BuildOutput>>;

    /// Inputs and outputs of each succeeded build of a job, newest first.
    async fn succeeded_build_versions(&self, pipeline_id: PipelineId, job: &str) -> Result<Vec<BuildVersions>>;

    /// Whether any build of the job used `version` for input `input`.
    async fn version_used(
        &self,
        pipeline_id: PipelineId,
        job: &str,
        input: &str,
        version: VersionId,
    ) -> Result<bool>;

    /// Version of `input` used by the job's most recent build, if any.
    async fn last_used_version(&self, pipeline_id: PipelineId, job: &str, input: &str) -> Result<Option<VersionId>>;
}

/// Durable per-build event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, assigning the next id in the build's log.
    async fn append(&self, build_id: BuildId, payload: EventPayload) -> Result<BuildEvent>;

    /// Read up to `limit` events with id >= `from`, in order.
    async fn read(&self, build_id: BuildId, from: u64, limit: usize) -> Result<Vec<BuildEvent>>;

    /// Mark the log complete; no further events will be appended.
    async fn mark_completed(&self, build_id: BuildId) -> Result<()>;

    async fn is_completed(&self, build_id: BuildId) -> Result<bool>;
}

/// Repository for workers, containers and volumes.
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Insert or update a worker. `active_containers` is derived on read.
    async fn save_worker(&self, worker: &Worker) -> Result<()>;

    async fn get_worker(&self, name: &str) -> Result<Option<Worker>>;

    async fn list_workers(&self) -> Result<Vec<Worker>>;

    async fn set_worker_state(&self, name: &str, state: WorkerState) -> Result<()>;

    async fn heartbeat_worker(&self, name: &str, at: DateTime<Utc>) -> Result<()>;

    /// Remove a worker with its containers and volumes.
    async fn delete_worker(&self, name: &str) -> Result<()>;

    async fn create_container(&self, container: &Container) -> Result<()>;

    async fn set_container_state(&self, id: ContainerId, state: ContainerState) -> Result<()>;

    /// Remove a container and the volumes it owns.
    async fn delete_container(&self, id: ContainerId) -> Result<()>;

    async fn list_containers(&self, worker: Option<&str>) -> Result<Vec<Container>>;

    async fn create_volume(&self, volume: &Volume) -> Result<()>;

    async fn list_volumes(&self, worker: Option<&str>) -> Result<Vec<Volume>>;

    /// Cache volumes with exactly this kind.
    async fn find_cache_volumes(&self, kind: &VolumeKind) -> Result<Vec<Volume>>;

    async fn delete_volume(&self, id: VolumeId) -> Result<()>;
}

/// A held exclusive section. Dropping without release frees it eventually.
#[async_trait]
pub trait Lock: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Source of non-blocking exclusive locks.
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Acquire the lock if free; `None` if another holder has it.
    async fn try_acquire(&self, id: &LockId) -> Result<Option<Box<dyn Lock>>>;
}

/// Input to the external version discovery capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub resource_type: String,
    pub source: Source,
    /// Latest known version, if any.
    pub from: Option<Version>,
    pub image: ImageSpec,
}

/// Discovers versions of a resource.
#[async_trait]
pub trait CheckCapability: Send + Sync {
    /// Versions newer than or equal to `from`, oldest first.
    async fn check(&self, request: &CheckRequest) -> Result<Vec<Version>>;
}

/// What a process does once its container is set up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ProcessAction {
    /// Fetch `version` into the `fetched` mount.
    Get {
        resource_type: String,
        source: Source,
        version: Version,
        params: Params,
    },
    /// Push artifacts and report the produced version.
    Put {
        resource_type: String,
        source: Source,
        params: Params,
    },
    Task { run: TaskRun },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountRole {
    Input,
    Output,
    Cache,
    /// Destination of a get.
    Fetched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    /// Artifact name.
    pub name: String,
    pub volume: VolumeId,
    /// Path relative to the container's working directory.
    pub path: String,
    pub role: MountRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub container_id: ContainerId,
    pub image: ImageSpec,
    pub action: ProcessAction,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: LogStream,
    pub line: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub exit_status: i32,
    /// Version fetched or produced by a get or put.
    pub version: Option<Version>,
    pub metadata: Vec<MetadataField>,
}

impl ProcessOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Runs processes in isolated environments on workers.
///
/// An `Err` from [`ContainerRuntime::run`] means the process could not be
/// executed; a nonzero exit status is reported through the outcome.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the backing storage for a volume on a worker.
    async fn create_volume(&self, worker: &Worker, volume: &Volume) -> Result<()>;

    /// Run a process and stream its output. Must stop the process promptly
    /// when `cancel` fires.
    async fn run(
        &self,
        worker: &Worker,
        spec: ProcessSpec,
        output: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome>;

    async fn destroy_container(&self, worker: &Worker, id: ContainerId) -> Result<()>;

    async fn destroy_volume(&self, worker: &Worker, id: VolumeId) -> Result<()>;
}

/// Hands created builds to whatever executes them.
#[async_trait]
pub trait BuildDispatcher: Send + Sync {
    async fn dispatch(&self, build: Build) -> Result<()>;
}
