//! Storage layer for Conveyor CI.
//!
//! PostgreSQL repositories for production and a [`MemoryStore`] that
//! implements the same ports in process memory.

pub mod memory;
pub mod repositories;

pub use memory::{MemoryLockFactory, MemoryStore};
pub use repositories::*;

use conveyor_core::ports::{
    BuildRepository, EventStore, LockFactory, PipelineRepository, VersionStore, WorkerRepository,
};
use conveyor_core::{Error, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(db_err)?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

/// Every storage port the orchestrator needs, behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub pipelines: Arc<dyn PipelineRepository>,
    pub versions: Arc<dyn VersionStore>,
    pub builds: Arc<dyn BuildRepository>,
    pub events: Arc<dyn EventStore>,
    pub workers: Arc<dyn WorkerRepository>,
    pub locks: Arc<dyn LockFactory>,
}

impl Stores {
    /// Stores sharing one in-memory state.
    pub fn memory() -> Self {
        let store = MemoryStore::new();
        Self {
            pipelines: Arc::new(store.clone()),
            versions: Arc::new(store.clone()),
            builds: Arc::new(store.clone()),
            events: Arc::new(store.clone()),
            workers: Arc::new(store),
            locks: Arc::new(MemoryLockFactory::new()),
        }
    }

    /// PostgreSQL-backed stores.
    pub fn postgres(db: &Database) -> Self {
        let pool = db.pool().clone();
        Self {
            pipelines: Arc::new(PgPipelineRepository::new(pool.clone())),
            versions: Arc::new(PgVersionStore::new(pool.clone())),
            builds: Arc::new(PgBuildRepository::new(pool.clone())),
            events: Arc::new(PgEventStore::new(pool.clone())),
            workers: Arc::new(PgWorkerRepository::new(pool.clone())),
            locks: Arc::new(PgLockFactory::new(pool)),
        }
    }
}
