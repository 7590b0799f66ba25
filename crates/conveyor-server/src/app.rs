//! Component wiring and the server's background loops.

use crate::config::ServerConfig;
use anyhow::Context;
use conveyor_api::{AppState, create_router};
use conveyor_checker::{Checker, CheckerRunner};
use conveyor_db::{Database, Stores};
use conveyor_engine::Engine;
use conveyor_events::EventLog;
use conveyor_runner::{HostRuntime, ScriptChecker};
use conveyor_scheduler::{SchedulerDeps, SchedulerRunner};
use conveyor_workers::{HeartbeatService, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct App {
    config: ServerConfig,
    state: Arc<AppState>,
    checker_runner: CheckerRunner,
}

impl App {
    pub async fn build(config: ServerConfig) -> anyhow::Result<Self> {
        let stores = match (&config.database.url, config.in_memory) {
            (Some(url), false) => {
                let db = Database::connect(url, config.database.max_connections)
                    .await
                    .context("connecting to the database")?;
                db.migrate().await.context("running migrations")?;
                info!("Using PostgreSQL stores");
                Stores::postgres(&db)
            }
            (None, false) => {
                warn!("No database URL configured, keeping state in memory");
                Stores::memory()
            }
            (_, true) => {
                info!("Using in-memory stores");
                Stores::memory()
            }
        };

        let runtime = Arc::new(HostRuntime::new(config.runtime.clone()));
        let pool = Arc::new(WorkerPool::new(
            stores.workers.clone(),
            runtime,
            config.pool_config(),
        ));
        let events = EventLog::new(
            stores.events.clone(),
            Duration::from_millis(config.events.poll_interval_ms),
        );
        let engine = Engine::new(
            stores.builds.clone(),
            stores.versions.clone(),
            stores.locks.clone(),
            events.clone(),
            pool.clone(),
            config.engine_config(),
        );

        let checker = Arc::new(Checker::new(
            stores.pipelines.clone(),
            stores.versions.clone(),
            Arc::new(ScriptChecker::new(config.runtime.clone())),
            config.checker_config(),
        ));
        let checker_runner = CheckerRunner::new(
            checker.clone(),
            Duration::from_secs(config.checker.sync_interval_secs),
        );
        let scheduler = Arc::new(SchedulerRunner::new(
            SchedulerDeps {
                pipelines: stores.pipelines.clone(),
                versions: stores.versions.clone(),
                builds: stores.builds.clone(),
                locks: stores.locks.clone(),
                dispatcher: Arc::new(engine.clone()),
            },
            Duration::from_secs(config.scheduler.tick_interval_secs),
            Duration::from_secs(config.scheduler.sync_interval_secs),
        ));

        let state = Arc::new(AppState {
            pipelines: stores.pipelines.clone(),
            versions: stores.versions.clone(),
            builds: stores.builds.clone(),
            events,
            pool,
            checker,
            scheduler,
            engine,
        });

        Ok(Self {
            config,
            state,
            checker_runner,
        })
    }

    /// Serve the API and run every loop until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self {
            config,
            state,
            checker_runner,
        } = self;
        let mut tasks = JoinSet::new();

        if config.workers.local.enabled {
            let registration = config.local_registration();
            state
                .pool
                .register(registration.clone())
                .await
                .context("registering the local worker")?;
            let heartbeat = HeartbeatService::new(
                state.pool.clone(),
                registration,
                config.workers.local.heartbeat_interval_secs,
            );
            tasks.spawn({
                let shutdown = shutdown.clone();
                async move { heartbeat.run(shutdown).await }
            });
        }

        let recovered = state.engine.recover().await.context("recovering builds")?;
        info!(
            errored = recovered.errored,
            redispatched = recovered.redispatched,
            "Recovered builds"
        );

        tasks.spawn({
            let pool = state.pool.clone();
            let interval = Duration::from_secs(config.workers.sweep_interval_secs);
            let shutdown = shutdown.clone();
            async move { pool.run_sweeper(interval, shutdown).await }
        });
        tasks.spawn({
            let shutdown = shutdown.clone();
            async move { checker_runner.run(shutdown).await }
        });
        tasks.spawn({
            let scheduler = state.scheduler.clone();
            let shutdown = shutdown.clone();
            async move { scheduler.run(shutdown).await }
        });

        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;
        info!(addr = %listener.local_addr()?, "API listening");
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await?;

        shutdown.cancel();
        while tasks.join_next().await.is_some() {}
        info!("Server stopped");
        Ok(())
    }
}
