//! Test contexts: a fully wired system and a PostgreSQL-only context.

use crate::containers::PostgresContainer;
use crate::fakes::{FakeCapability, FakeRuntime};
use anyhow::Context as _;
use conveyor_api::{AppState, create_router};
use conveyor_checker::{Checker, CheckerConfig};
use conveyor_core::build::Build;
use conveyor_core::check::CheckHandle;
use conveyor_core::ids::{BuildId, PipelineId};
use conveyor_core::pipeline::{CheckableKind, Pipeline, PipelineConfig};
use conveyor_core::worker::{Worker, WorkerRegistration};
use conveyor_db::{Database, Stores};
use conveyor_engine::{Engine, EngineConfig};
use conveyor_events::EventLog;
use conveyor_scheduler::{SchedulerDeps, SchedulerRunner, TickSummary};
use conveyor_workers::{PoolConfig, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

/// How long waits for checks and builds give up after.
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(20);

/// Every component wired together as the server does it, with fakes for
/// checking and running processes.
pub struct TestSystem {
    pub stores: Stores,
    pub capability: Arc<FakeCapability>,
    pub runtime: Arc<FakeRuntime>,
    pub pool: Arc<WorkerPool>,
    pub engine: Engine,
    pub checker: Arc<Checker>,
    pub scheduler: Arc<SchedulerRunner>,
    pub state: Arc<AppState>,
}

impl TestSystem {
    /// A system over in-memory stores with one registered worker.
    pub async fn new() -> Self {
        Self::with_stores(Stores::memory())
            .await
            .expect("Failed to start in-memory system")
    }

    pub async fn with_stores(stores: Stores) -> anyhow::Result<Self> {
        crate::init_test_logging();

        let capability = Arc::new(FakeCapability::default());
        let runtime = Arc::new(FakeRuntime::default());
        let pool = Arc::new(WorkerPool::new(
            stores.workers.clone(),
            runtime.clone(),
            PoolConfig::default(),
        ));
        let events = EventLog::new(stores.events.clone(), POLL);
        let engine = Engine::new(
            stores.builds.clone(),
            stores.versions.clone(),
            stores.locks.clone(),
            events.clone(),
            pool.clone(),
            EngineConfig {
                abort_poll_interval: POLL,
                ..Default::default()
            },
        );
        let checker = Arc::new(Checker::new(
            stores.pipelines.clone(),
            stores.versions.clone(),
            capability.clone(),
            CheckerConfig::default(),
        ));
        let scheduler = Arc::new(SchedulerRunner::new(
            SchedulerDeps {
                pipelines: stores.pipelines.clone(),
                versions: stores.versions.clone(),
                builds: stores.builds.clone(),
                locks: stores.locks.clone(),
                dispatcher: Arc::new(engine.clone()),
            },
            Duration::from_secs(10),
            Duration::from_secs(10),
        ));
        let state = Arc::new(AppState {
            pipelines: stores.pipelines.clone(),
            versions: stores.versions.clone(),
            builds: stores.builds.clone(),
            events,
            pool: pool.clone(),
            checker: checker.clone(),
            scheduler: scheduler.clone(),
            engine: engine.clone(),
        });

        let system = Self {
            stores,
            capability,
            runtime,
            pool,
            engine,
            checker,
            scheduler,
            state,
        };
        system.register_worker("worker-1").await?;
        Ok(system)
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    pub async fn register_worker(&self, name: &str) -> anyhow::Result<Worker> {
        Ok(self
            .pool
            .register(WorkerRegistration {
                name: name.to_string(),
                platform: "linux".to_string(),
                tags: vec![],
                team: None,
                resource_types: vec!["git".to_string(), "registry-image".to_string()],
                version: Some("1.0".to_string()),
            })
            .await?)
    }

    /// Save a pipeline from its YAML config.
    pub async fn save_pipeline(&self, name: &str, yaml: &str) -> anyhow::Result<Pipeline> {
        let config: PipelineConfig = serde_yaml::with::singleton_map_recursive::deserialize(
            serde_yaml::Deserializer::from_str(yaml),
        )?;
        Ok(self.stores.pipelines.save("main", name, &config, None).await?)
    }

    /// Run a check of `resource` to completion.
    pub async fn check(&self, pipeline_id: PipelineId, resource: &str) -> anyhow::Result<CheckHandle> {
        let handle = self
            .checker
            .request_check(pipeline_id, CheckableKind::Resource, resource)
            .await?;
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let current = self.checker.check_status(handle.id)?;
            if current.status.is_finished() {
                return Ok(current);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "check of {resource} did not finish"
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// One scheduling pass over the pipeline.
    pub async fn tick(&self, pipeline_id: PipelineId) -> anyhow::Result<TickSummary> {
        Ok(self.scheduler.context(pipeline_id).tick().await?)
    }

    /// Wait for a build to reach a terminal status.
    pub async fn wait_for_build(&self, id: BuildId) -> anyhow::Result<Build> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let build = self
                .stores
                .builds
                .get(id)
                .await?
                .with_context(|| format!("build {id} not found"))?;
            if build.status.is_terminal() {
                return Ok(build);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "build {id} is still {}",
                build.status.as_str()
            );
            tokio::time::sleep(POLL).await;
        }
    }

    /// Builds of `job`, newest first.
    pub async fn builds(&self, pipeline_id: PipelineId, job: &str) -> anyhow::Result<Vec<Build>> {
        Ok(self.stores.builds.list_for_job(pipeline_id, job, 100).await?)
    }
}

/// PostgreSQL running in a container, migrated and ready.
///
/// Drop this to stop the container.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl TestContext {
    pub async fn postgres_only() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string(), 5).await?;
        db.migrate().await?;

        Ok(Self { postgres, db })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }

    pub fn stores(&self) -> Stores {
        Stores::postgres(&self.db)
    }
}
