//! Per-pipeline scheduling: decides which jobs get a new build.

use crate::compiler::{CompileInputs, compile_job};
use crate::resolver::{InputResolver, Resolution, ResolvedInput};
use conveyor_core::build::{Build, BuildInput, NewBuild};
use conveyor_core::ids::PipelineId;
use conveyor_core::lock::LockId;
use conveyor_core::pipeline::{CheckableKind, JobConfig, Pipeline};
use conveyor_core::ports::{
    BuildDispatcher, BuildRepository, Lock, LockFactory, PipelineRepository, VersionStore,
};
use conveyor_core::version::Version;
use conveyor_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Everything a scheduler needs from the outside world.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub versions: Arc<dyn VersionStore>,
    pub builds: Arc<dyn BuildRepository>,
    pub locks: Arc<dyn LockFactory>,
    pub dispatcher: Arc<dyn BuildDispatcher>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum NotReadyReason {
    Paused,
    MaxInFlight { limit: u32 },
    SerialGroupBusy { job: String },
    Inputs { detail: String },
    NoNewVersions,
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::Paused => write!(f, "job or pipeline is paused"),
            NotReadyReason::MaxInFlight { limit } => {
                write!(f, "{limit} build(s) already in flight")
            }
            NotReadyReason::SerialGroupBusy { job } => {
                write!(f, "serial group peer {job} has a build in flight")
            }
            NotReadyReason::Inputs { detail } => write!(f, "{detail}"),
            NotReadyReason::NoNewVersions => write!(f, "no new versions of trigger inputs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobDecision {
    Ready(Vec<ResolvedInput>),
    NotReady(NotReadyReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TriggerOutcome {
    Created(Build),
    /// The request is remembered and served on a later tick.
    Queued { pending: u32, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub created: usize,
    pub not_ready: usize,
    /// Jobs another scheduler was already working on.
    pub locked: usize,
    pub errored: usize,
}

enum JobResult {
    Created(Build),
    NotReady(NotReadyReason),
    Locked,
}

pub struct SchedulerContext {
    pipeline_id: PipelineId,
    deps: SchedulerDeps,
    resolver: InputResolver,
}

impl SchedulerContext {
    pub fn new(pipeline_id: PipelineId, deps: SchedulerDeps) -> Self {
        let resolver = InputResolver::new(
            deps.pipelines.clone(),
            deps.versions.clone(),
            deps.builds.clone(),
        );
        Self {
            pipeline_id,
            deps,
            resolver,
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// One scheduling pass over every job of the pipeline.
    pub async fn tick(&self) -> Result<TickSummary> {
        let pipeline = self.pipeline().await?;
        let mut summary = TickSummary::default();
        if !pipeline.is_active() {
            return Ok(summary);
        }

        for job in &pipeline.config.jobs {
            match self.schedule(&pipeline, job).await {
                Ok(JobResult::Created(_)) => summary.created += 1,
                Ok(JobResult::NotReady(reason)) => {
                    debug!(pipeline_id = %self.pipeline_id, job = %job.name, %reason, "Job not ready");
                    summary.not_ready += 1;
                }
                Ok(JobResult::Locked) => summary.locked += 1,
                Err(e) => {
                    error!(pipeline_id = %self.pipeline_id, job = %job.name, error = %e, "Failed to schedule job");
                    summary.errored += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Decide whether `job` may get a build now.
    ///
    /// A `manual` evaluation does not require new trigger versions.
    pub async fn evaluate_job(
        &self,
        pipeline: &Pipeline,
        job: &JobConfig,
        manual: bool,
    ) -> Result<JobDecision> {
        let state = self
            .deps
            .pipelines
            .job_state(pipeline.id, &job.name)
            .await?
            .ok_or_else(|| Error::JobNotFound(job.name.clone()))?;
        if pipeline.paused || state.paused {
            return Ok(JobDecision::NotReady(NotReadyReason::Paused));
        }

        if let Some(limit) = job.max_in_flight() {
            let active = self.deps.builds.active_for_job(pipeline.id, &job.name).await?;
            if active.len() >= limit as usize {
                return Ok(JobDecision::NotReady(NotReadyReason::MaxInFlight { limit }));
            }
        }
        for peer in pipeline.config.serial_group_peers(job) {
            let active = self.deps.builds.active_for_job(pipeline.id, &peer.name).await?;
            if !active.is_empty() {
                return Ok(JobDecision::NotReady(NotReadyReason::SerialGroupBusy {
                    job: peer.name.clone(),
                }));
            }
        }

        let inputs = match self.resolver.resolve(pipeline, job).await? {
            Resolution::Ready(inputs) => inputs,
            Resolution::NotReady(detail) => {
                return Ok(JobDecision::NotReady(NotReadyReason::Inputs { detail }));
            }
        };
        if !manual && !inputs.iter().any(|i| i.trigger && i.first_occurrence) {
            return Ok(JobDecision::NotReady(NotReadyReason::NoNewVersions));
        }
        Ok(JobDecision::Ready(inputs))
    }

    /// Manually request a build of `job`.
    ///
    /// Creates the build right away when the job is ready, otherwise queues
    /// the request for a later tick.
    pub async fn trigger_job(&self, job: &str) -> Result<TriggerOutcome> {
        let pipeline = self.pipeline().await?;
        let config = pipeline
            .config
            .job(job)
            .ok_or_else(|| Error::JobNotFound(job.to_string()))?;
        if config.disable_manual_trigger {
            return Err(Error::ManualTriggerDisabled(job.to_string()));
        }

        let reason = match self.with_job_lock(&pipeline, config, true).await? {
            JobResult::Created(build) => return Ok(TriggerOutcome::Created(build)),
            JobResult::NotReady(reason) => reason.to_string(),
            JobResult::Locked => "job is being scheduled".to_string(),
        };
        let pending = self.deps.pipelines.request_trigger(pipeline.id, job).await?;
        info!(pipeline_id = %pipeline.id, job, pending, %reason, "Queued manual trigger");
        Ok(TriggerOutcome::Queued { pending, reason })
    }

    /// Tick until `shutdown` fires. Errors are logged and the loop goes on.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        info!(pipeline_id = %self.pipeline_id, "Starting pipeline scheduler");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) => debug!(pipeline_id = %self.pipeline_id, ?summary, "Scheduling tick"),
                        Err(e) => error!(pipeline_id = %self.pipeline_id, error = %e, "Scheduling tick failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(pipeline_id = %self.pipeline_id, "Pipeline scheduler stopped");
                    break;
                }
            }
        }
    }

    async fn pipeline(&self) -> Result<Pipeline> {
        self.deps
            .pipelines
            .get(self.pipeline_id)
            .await?
            .ok_or_else(|| Error::PipelineNotFound(self.pipeline_id.to_string()))
    }

    /// Serve a queued manual trigger if there is one, else look for new
    /// versions.
    async fn schedule(&self, pipeline: &Pipeline, job: &JobConfig) -> Result<JobResult> {
        let pending = self
            .deps
            .pipelines
            .job_state(pipeline.id, &job.name)
            .await?
            .is_some_and(|s| s.pending_triggers > 0);
        self.with_job_lock(pipeline, job, pending).await
    }

    /// Evaluate and create under the job's scheduling lock and the locks of
    /// its serial groups, then dispatch.
    async fn with_job_lock(
        &self,
        pipeline: &Pipeline,
        job: &JobConfig,
        manual: bool,
    ) -> Result<JobResult> {
        let mut ids = vec![LockId::job(pipeline.id, job.name.as_str())];
        let mut groups: Vec<&String> = job.serial_groups.iter().collect();
        groups.sort();
        groups.dedup();
        ids.extend(
            groups
                .into_iter()
                .map(|g| LockId::serial_group(pipeline.id, g.as_str())),
        );

        let mut held = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.deps.locks.try_acquire(id).await {
                Ok(Some(lock)) => held.push(lock),
                Ok(None) => {
                    release_all(held).await?;
                    return Ok(JobResult::Locked);
                }
                Err(e) => {
                    release_all(held).await?;
                    return Err(e);
                }
            }
        }

        let result = self.create_if_ready(pipeline, job, manual).await;
        release_all(held).await?;

        let result = result?;
        if let JobResult::Created(build) = &result {
            if let Err(e) = self.deps.dispatcher.dispatch(build.clone()).await {
                warn!(build_id = %build.id, error = %e, "Failed to dispatch build, it stays pending");
            }
        }
        Ok(result)
    }

    async fn create_if_ready(
        &self,
        pipeline: &Pipeline,
        job: &JobConfig,
        manual: bool,
    ) -> Result<JobResult> {
        let inputs = match self.evaluate_job(pipeline, job, manual).await? {
            JobDecision::Ready(inputs) => inputs,
            JobDecision::NotReady(reason) => return Ok(JobResult::NotReady(reason)),
        };

        let type_versions = self.type_versions(pipeline).await?;
        let versions: BTreeMap<_, _> = inputs
            .iter()
            .map(|i| (i.name.clone(), i.version.clone()))
            .collect();
        let plan = compile_job(
            job,
            &CompileInputs {
                pipeline_id: pipeline.id,
                config: &pipeline.config,
                versions: &versions,
                type_versions: &type_versions,
            },
        )?;

        if manual {
            // A queued request is consumed by the build that serves it.
            self.deps
                .pipelines
                .take_trigger_request(pipeline.id, &job.name)
                .await?;
        }

        let build_inputs = inputs
            .iter()
            .map(|i| BuildInput {
                name: i.name.clone(),
                resource: i.resource.clone(),
                version_id: i.version.id,
                first_occurrence: i.first_occurrence,
            })
            .collect();
        let mut new = NewBuild::for_job(&pipeline.team, pipeline.id, &job.name, plan, build_inputs);
        new.manually_triggered = manual;
        let build = self.deps.builds.create(new).await?;

        info!(
            pipeline_id = %pipeline.id,
            job = %job.name,
            build_id = %build.id,
            number = ?build.number,
            manual,
            "Created build"
        );
        Ok(JobResult::Created(build))
    }

    async fn type_versions(&self, pipeline: &Pipeline) -> Result<BTreeMap<String, Version>> {
        let mut versions = BTreeMap::new();
        for state in self.deps.pipelines.resource_states(pipeline.id).await? {
            if state.kind != CheckableKind::ResourceType {
                continue;
            }
            let Some(scope_id) = &state.scope_id else {
                continue;
            };
            if let Some(latest) = self.deps.versions.latest_enabled(scope_id).await? {
                versions.insert(state.name, latest.version);
            }
        }
        Ok(versions)
    }
}

async fn release_all(locks: Vec<Box<dyn Lock>>) -> Result<()> {
    for lock in locks.into_iter().rev() {
        lock.release().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingDispatcher, discover};
    use conveyor_core::build::BuildStatus;
    use conveyor_core::pipeline::{GetStep, PipelineConfig, ResourceConfig, StepConfig};
    use conveyor_core::version::Source;
    use conveyor_db::{MemoryLockFactory, MemoryStore};
    use pretty_assertions::assert_eq;

    fn resource(name: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: "git".to_string(),
            source: Source::from([("uri".to_string(), serde_json::json!(name))]),
            check_every_secs: None,
            version: None,
            tags: vec![],
        }
    }

    fn job(name: &str, trigger: bool) -> JobConfig {
        let mut get = GetStep::new("repo");
        get.trigger = trigger;
        JobConfig::new(name, vec![StepConfig::Get(get)])
    }

    struct Fixture {
        store: MemoryStore,
        locks: MemoryLockFactory,
        dispatcher: Arc<RecordingDispatcher>,
        context: SchedulerContext,
        pipeline: Pipeline,
    }

    impl Fixture {
        async fn new(jobs: Vec<JobConfig>) -> Self {
            let store = MemoryStore::new();
            let locks = MemoryLockFactory::new();
            let dispatcher = Arc::new(RecordingDispatcher::default());
            let config = PipelineConfig {
                jobs,
                resources: vec![resource("repo")],
                resource_types: vec![],
            };
            let pipeline = store.save("main", "ci", &config, None).await.unwrap();
            let deps = SchedulerDeps {
                pipelines: Arc::new(store.clone()),
                versions: Arc::new(store.clone()),
                builds: Arc::new(store.clone()),
                locks: Arc::new(locks.clone()),
                dispatcher: dispatcher.clone(),
            };
            Self {
                context: SchedulerContext::new(pipeline.id, deps),
                store,
                locks,
                dispatcher,
                pipeline,
            }
        }

        async fn evaluate(&self, job: &str, manual: bool) -> JobDecision {
            let config = self.pipeline.config.job(job).unwrap();
            self.context.evaluate_job(&self.pipeline, config, manual).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_new_trigger_version_creates_one_build() {
        let fixture = Fixture::new(vec![job("unit", true)]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["a"]).await;

        let summary = fixture.context.tick().await.unwrap();
        assert_eq!(summary.created, 1);
        let summary = fixture.context.tick().await.unwrap();
        assert_eq!(summary.created, 0);
        assert_eq!(summary.not_ready, 1);

        let dispatched = fixture.dispatcher.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].number, Some(1));
        assert!(!dispatched[0].manually_triggered);
        let inputs = fixture.store.inputs(dispatched[0].id).await.unwrap();
        assert_eq!(inputs.len(), 1);
        assert!(inputs[0].first_occurrence);
    }

    #[tokio::test]
    async fn test_non_trigger_input_waits_for_manual_trigger() {
        let fixture = Fixture::new(vec![job("unit", false)]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["a"]).await;

        assert_eq!(
            fixture.evaluate("unit", false).await,
            JobDecision::NotReady(NotReadyReason::NoNewVersions)
        );
        let TriggerOutcome::Created(build) = fixture.context.trigger_job("unit").await.unwrap() else {
            panic!("expected a build");
        };
        assert!(build.manually_triggered);
        assert_eq!(fixture.dispatcher.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn test_serial_job_respects_in_flight_limit() {
        let mut serial = job("unit", true);
        serial.serial = true;
        let fixture = Fixture::new(vec![serial]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["a"]).await;
        assert_eq!(fixture.context.tick().await.unwrap().created, 1);

        discover(&fixture.store, &fixture.pipeline, "repo", &["a", "b"]).await;
        assert_eq!(
            fixture.evaluate("unit", false).await,
            JobDecision::NotReady(NotReadyReason::MaxInFlight { limit: 1 })
        );

        let build = &fixture.dispatcher.dispatched()[0];
        fixture
            .store
            .transition(build.id, BuildStatus::Pending, BuildStatus::Succeeded)
            .await
            .unwrap();
        assert_eq!(fixture.context.tick().await.unwrap().created, 1);
        assert_eq!(fixture.dispatcher.dispatched()[1].number, Some(2));
    }

    #[tokio::test]
    async fn test_serial_group_peers_exclude_each_other() {
        let mut a = job("a", true);
        a.serial_groups = vec!["deploy".to_string()];
        let mut b = job("b", true);
        b.serial_groups = vec!["deploy".to_string()];
        let fixture = Fixture::new(vec![a, b]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["v1"]).await;

        let summary = fixture.context.tick().await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(
            fixture.evaluate("b", false).await,
            JobDecision::NotReady(NotReadyReason::SerialGroupBusy {
                job: "a".to_string()
            })
        );
    }

    fn grouped(name: &str) -> JobConfig {
        let mut job = job(name, false);
        job.serial_groups = vec!["deploy".to_string()];
        job
    }

    #[tokio::test]
    async fn test_serial_group_lock_blocks_peer_creation() {
        let fixture = Fixture::new(vec![grouped("a"), grouped("b")]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["v1"]).await;

        // A peer is mid-creation: it passed its own checks and holds the group.
        let group = fixture
            .locks
            .try_acquire(&LockId::serial_group(fixture.pipeline.id, "deploy"))
            .await
            .unwrap()
            .unwrap();
        let outcome = fixture.context.trigger_job("b").await.unwrap();
        assert!(matches!(
            outcome,
            TriggerOutcome::Queued { pending: 1, ref reason } if reason == "job is being scheduled"
        ));
        assert!(fixture.dispatcher.dispatched().is_empty());

        // The job lock taken before the group lock was given back.
        fixture
            .locks
            .try_acquire(&LockId::job(fixture.pipeline.id, "b"))
            .await
            .unwrap()
            .expect("job lock is free")
            .release()
            .await
            .unwrap();

        group.release().await.unwrap();
        assert_eq!(fixture.context.tick().await.unwrap().created, 1);
        assert_eq!(fixture.dispatcher.dispatched()[0].job.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_concurrent_triggers_never_overlap() {
        let fixture = Fixture::new(vec![grouped("a"), grouped("b")]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["v1"]).await;

        let ctx = &fixture.context;
        let (a1, b1, a2, b2) = tokio::join!(
            ctx.trigger_job("a"),
            ctx.trigger_job("b"),
            ctx.trigger_job("a"),
            ctx.trigger_job("b"),
        );
        let created = [a1, b1, a2, b2]
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|o| matches!(o, TriggerOutcome::Created(_)))
            .count();
        assert_eq!(created, 1);

        // Queued triggers wait while the group has a build in flight.
        assert_eq!(fixture.context.tick().await.unwrap().created, 0);
        let mut active = fixture.store.active_for_job(fixture.pipeline.id, "a").await.unwrap();
        active.extend(fixture.store.active_for_job(fixture.pipeline.id, "b").await.unwrap());
        assert_eq!(active.len(), 1);

        let mut serial = job("unit", false);
        serial.max_in_flight = Some(1);
        let fixture = Fixture::new(vec![serial]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["v1"]).await;
        let ctx = &fixture.context;
        let (first, second) = tokio::join!(ctx.trigger_job("unit"), ctx.trigger_job("unit"));
        let created = [first, second]
            .into_iter()
            .filter(|r| matches!(r, Ok(TriggerOutcome::Created(_))))
            .count();
        assert_eq!(created, 1);
        assert_eq!(
            fixture.store.active_for_job(fixture.pipeline.id, "unit").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_manual_trigger_queues_until_ready() {
        let fixture = Fixture::new(vec![job("unit", false)]).await;

        let outcome = fixture.context.trigger_job("unit").await.unwrap();
        let TriggerOutcome::Queued { pending, reason } = outcome else {
            panic!("expected queued");
        };
        assert_eq!(pending, 1);
        assert_eq!(reason, "resource repo has not been checked");

        discover(&fixture.store, &fixture.pipeline, "repo", &["a"]).await;
        assert_eq!(fixture.context.tick().await.unwrap().created, 1);
        assert!(fixture.dispatcher.dispatched()[0].manually_triggered);

        let state = fixture
            .store
            .job_state(fixture.pipeline.id, "unit")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.pending_triggers, 0);
    }

    #[tokio::test]
    async fn test_trigger_errors() {
        let mut locked_out = job("locked-out", true);
        locked_out.disable_manual_trigger = true;
        let fixture = Fixture::new(vec![locked_out]).await;

        assert!(matches!(
            fixture.context.trigger_job("locked-out").await,
            Err(Error::ManualTriggerDisabled(_))
        ));
        assert!(matches!(
            fixture.context.trigger_job("missing").await,
            Err(Error::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_paused_and_locked_jobs_are_skipped() {
        let fixture = Fixture::new(vec![job("unit", true)]).await;
        discover(&fixture.store, &fixture.pipeline, "repo", &["a"]).await;

        fixture
            .store
            .set_job_paused(fixture.pipeline.id, "unit", true)
            .await
            .unwrap();
        assert_eq!(
            fixture.evaluate("unit", false).await,
            JobDecision::NotReady(NotReadyReason::Paused)
        );
        fixture
            .store
            .set_job_paused(fixture.pipeline.id, "unit", false)
            .await
            .unwrap();

        let held = fixture
            .locks
            .try_acquire(&LockId::job(fixture.pipeline.id, "unit"))
            .await
            .unwrap()
            .unwrap();
        let summary = fixture.context.tick().await.unwrap();
        assert_eq!(summary.locked, 1);
        assert_eq!(summary.created, 0);

        held.release().await.unwrap();
        assert_eq!(fixture.context.tick().await.unwrap().created, 1);
    }
}
