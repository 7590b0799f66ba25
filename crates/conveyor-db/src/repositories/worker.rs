//! PostgreSQL implementation of WorkerRepository.

use crate::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ids::{BuildId, ContainerId, PlanId, VolumeId};
use conveyor_core::ports::WorkerRepository;
use conveyor_core::worker::{Container, ContainerState, Volume, VolumeKind, Worker, WorkerState};
use conveyor_core::{Error, Result};
use sqlx::{PgPool, Row};

const WORKER_SELECT: &str = r#"SELECT w.name, w.platform, w.tags, w.team, w.resource_types, w.state, w.version, w.last_heartbeat,
       (SELECT COUNT(*) FROM containers c WHERE c.worker = w.name) AS active_containers
   FROM workers w"#;

pub struct PgWorkerRepository {
    pool: PgPool,
}

impl PgWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_worker(r: &sqlx::postgres::PgRow) -> Result<Worker> {
        let state: String = r.get("state");
        Ok(Worker {
            name: r.get("name"),
            platform: r.get("platform"),
            tags: r.get("tags"),
            team: r.get("team"),
            resource_types: r.get("resource_types"),
            state: WorkerState::parse(&state)
                .ok_or_else(|| Error::Database(format!("unknown worker state: {state}")))?,
            version: r.get("version"),
            active_containers: r.get::<i64, _>("active_containers") as u32,
            last_heartbeat: r.get("last_heartbeat"),
        })
    }

    fn row_to_container(r: &sqlx::postgres::PgRow) -> Result<Container> {
        let state: String = r.get("state");
        Ok(Container {
            id: ContainerId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            worker: r.get("worker"),
            build_id: r.get::<Option<uuid::Uuid>, _>("build_id").map(BuildId::from_uuid),
            plan_id: r.get::<Option<String>, _>("plan_id").map(PlanId::new),
            state: ContainerState::parse(&state)
                .ok_or_else(|| Error::Database(format!("unknown container state: {state}")))?,
            created_at: r.get("created_at"),
        })
    }

    fn row_to_volume(r: &sqlx::postgres::PgRow) -> Result<Volume> {
        Ok(Volume {
            id: VolumeId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            worker: r.get("worker"),
            kind: serde_json::from_value(r.get("kind"))?,
            container_id: r
                .get::<Option<uuid::Uuid>, _>("container_id")
                .map(ContainerId::from_uuid),
            created_at: r.get("created_at"),
        })
    }

    fn missing_worker(e: sqlx::Error, worker: &str) -> Error {
        if let sqlx::Error::Database(d) = &e {
            if d.is_foreign_key_violation() {
                return Error::WorkerNotFound(worker.to_string());
            }
        }
        db_err(e)
    }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn save_worker(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO workers (name, platform, tags, team, resource_types, state, version, last_heartbeat)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (name) DO UPDATE SET platform = EXCLUDED.platform, tags = EXCLUDED.tags, team = EXCLUDED.team,
                   resource_types = EXCLUDED.resource_types, state = EXCLUDED.state, version = EXCLUDED.version,
                   last_heartbeat = EXCLUDED.last_heartbeat"#,
        )
        .bind(&worker.name)
        .bind(&worker.platform)
        .bind(&worker.tags)
        .bind(&worker.team)
        .bind(&worker.resource_types)
        .bind(worker.state.as_str())
        .bind(&worker.version)
        .bind(worker.last_heartbeat)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_worker(&self, name: &str) -> Result<Option<Worker>> {
        let row = sqlx::query(&format!("{WORKER_SELECT} WHERE w.name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn list_workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query(&format!("{WORKER_SELECT} ORDER BY w.name"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn set_worker_state(&self, name: &str, state: WorkerState) -> Result<()> {
        let result = sqlx::query("UPDATE workers SET state = $2 WHERE name = $1")
            .bind(name)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::WorkerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn heartbeat_worker(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::WorkerNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn delete_worker(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn create_container(&self, container: &Container) -> Result<()> {
        sqlx::query(
            "INSERT INTO containers (id, worker, build_id, plan_id, state, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(container.id.as_uuid())
        .bind(&container.worker)
        .bind(container.build_id.map(|b| *b.as_uuid()))
        .bind(container.plan_id.as_ref().map(|p| p.as_str()))
        .bind(container.state.as_str())
        .bind(container.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::missing_worker(e, &container.worker))?;
        Ok(())
    }

    async fn set_container_state(&self, id: ContainerId, state: ContainerState) -> Result<()> {
        let result = sqlx::query("UPDATE containers SET state = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::ContainerNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete_container(&self, id: ContainerId) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_containers(&self, worker: Option<&str>) -> Result<Vec<Container>> {
        let rows = sqlx::query(
            "SELECT id, worker, build_id, plan_id, state, created_at FROM containers WHERE $1::text IS NULL OR worker = $1 ORDER BY created_at",
        )
        .bind(worker)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_container).collect()
    }

    async fn create_volume(&self, volume: &Volume) -> Result<()> {
        sqlx::query(
            "INSERT INTO volumes (id, worker, kind, container_id, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(volume.id.as_uuid())
        .bind(&volume.worker)
        .bind(serde_json::to_value(&volume.kind)?)
        .bind(volume.container_id.map(|c| *c.as_uuid()))
        .bind(volume.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::missing_worker(e, &volume.worker))?;
        Ok(())
    }

    async fn list_volumes(&self, worker: Option<&str>) -> Result<Vec<Volume>> {
        let rows = sqlx::query(
            "SELECT id, worker, kind, container_id, created_at FROM volumes WHERE $1::text IS NULL OR worker = $1 ORDER BY created_at",
        )
        .bind(worker)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_volume).collect()
    }

    async fn find_cache_volumes(&self, kind: &VolumeKind) -> Result<Vec<Volume>> {
        let rows = sqlx::query(
            "SELECT id, worker, kind, container_id, created_at FROM volumes WHERE kind = $1 ORDER BY created_at",
        )
        .bind(serde_json::to_value(kind)?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_volume).collect()
    }

    async fn delete_volume(&self, id: VolumeId) -> Result<()> {
        sqlx::query("DELETE FROM volumes WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
