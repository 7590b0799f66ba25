//! PostgreSQL implementation of PipelineRepository.

use crate::db_err;
use async_trait::async_trait;
use conveyor_core::ids::{PipelineId, ScopeId, VersionId};
use conveyor_core::pipeline::{CheckableKind, JobState, Pipeline, PipelineConfig, ResourceState};
use conveyor_core::ports::PipelineRepository;
use conveyor_core::{Error, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};

const PIPELINE_COLUMNS: &str =
    "id, team, name, config, config_version, paused, archived, created_at, updated_at";

pub struct PgPipelineRepository {
    pool: PgPool,
}

impl PgPipelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_pipeline(r: &sqlx::postgres::PgRow) -> Result<Pipeline> {
        let config: PipelineConfig = serde_json::from_value(r.get("config"))?;
        Ok(Pipeline {
            id: PipelineId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            team: r.get("team"),
            name: r.get("name"),
            config,
            config_version: r.get("config_version"),
            paused: r.get("paused"),
            archived: r.get("archived"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        })
    }

    fn row_to_resource(r: &sqlx::postgres::PgRow) -> Result<ResourceState> {
        let kind: String = r.get("kind");
        Ok(ResourceState {
            pipeline_id: PipelineId::from_uuid(r.get::<uuid::Uuid, _>("pipeline_id")),
            kind: CheckableKind::parse(&kind)
                .ok_or_else(|| Error::Database(format!("unknown checkable kind: {kind}")))?,
            name: r.get("name"),
            scope_id: r.get::<Option<String>, _>("scope_id").map(ScopeId::new),
            pinned_version: r
                .get::<Option<uuid::Uuid>, _>("pinned_version_id")
                .map(VersionId::from_uuid),
            pin_comment: r.get("pin_comment"),
            check_error: r.get("check_error"),
        })
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> JobState {
        JobState {
            pipeline_id: PipelineId::from_uuid(r.get::<uuid::Uuid, _>("pipeline_id")),
            name: r.get("name"),
            paused: r.get("paused"),
            pending_triggers: r.get::<i32, _>("pending_triggers") as u32,
            build_number_seq: r.get::<i64, _>("build_number_seq") as u64,
        }
    }

    async fn sync_runtime_state(
        tx: &mut Transaction<'_, Postgres>,
        pipeline_id: PipelineId,
        config: &PipelineConfig,
    ) -> Result<()> {
        let jobs: Vec<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
        sqlx::query("DELETE FROM jobs WHERE pipeline_id = $1 AND NOT (name = ANY($2))")
            .bind(pipeline_id.as_uuid())
            .bind(&jobs)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "INSERT INTO jobs (pipeline_id, name) SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING",
        )
        .bind(pipeline_id.as_uuid())
        .bind(&jobs)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        let groups = [
            (
                CheckableKind::Resource,
                config.resources.iter().map(|r| r.name.clone()).collect::<Vec<_>>(),
            ),
            (
                CheckableKind::ResourceType,
                config.resource_types.iter().map(|t| t.name.clone()).collect(),
            ),
        ];
        for (kind, names) in groups {
            sqlx::query(
                "DELETE FROM resources WHERE pipeline_id = $1 AND kind = $2 AND NOT (name = ANY($3))",
            )
            .bind(pipeline_id.as_uuid())
            .bind(kind.as_str())
            .bind(&names)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
            sqlx::query(
                "INSERT INTO resources (pipeline_id, kind, name) SELECT $1, $2, unnest($3::text[]) ON CONFLICT DO NOTHING",
            )
            .bind(pipeline_id.as_uuid())
            .bind(kind.as_str())
            .bind(&names)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn fetch_job(&self, pipeline_id: PipelineId, job: &str, sql: &str) -> Result<Option<JobState>> {
        let row = sqlx::query(sql)
            .bind(pipeline_id.as_uuid())
            .bind(job)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.as_ref().map(Self::row_to_job))
    }
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    async fn save(
        &self,
        team: &str,
        name: &str,
        config: &PipelineConfig,
        expected_version: Option<i64>,
    ) -> Result<Pipeline> {
        config.validate()?;
        let config_json = serde_json::to_value(config)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query(
            "SELECT config_version FROM pipelines WHERE team = $1 AND name = $2 FOR UPDATE",
        )
        .bind(team)
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let row = match existing {
            Some(r) => {
                let found: i64 = r.get("config_version");
                if let Some(expected) = expected_version {
                    if expected != found {
                        return Err(Error::ConfigConflict { expected, found });
                    }
                }
                sqlx::query(&format!(
                    "UPDATE pipelines SET config = $3, config_version = config_version + 1, archived = FALSE, updated_at = NOW() WHERE team = $1 AND name = $2 RETURNING {PIPELINE_COLUMNS}"
                ))
                .bind(team)
                .bind(name)
                .bind(&config_json)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?
            }
            None => {
                if let Some(expected) = expected_version.filter(|v| *v != 0) {
                    return Err(Error::ConfigConflict { expected, found: 0 });
                }
                sqlx::query(&format!(
                    "INSERT INTO pipelines (id, team, name, config) VALUES ($1, $2, $3, $4) RETURNING {PIPELINE_COLUMNS}"
                ))
                .bind(PipelineId::new().as_uuid())
                .bind(team)
                .bind(name)
                .bind(&config_json)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?
            }
        };

        let pipeline = Self::row_to_pipeline(&row)?;
        Self::sync_runtime_state(&mut tx, pipeline.id, config).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(pipeline)
    }

    async fn get(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let row = sqlx::query(&format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn find(&self, team: &str, name: &str) -> Result<Option<Pipeline>> {
        let row = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE team = $1 AND name = $2"
        ))
        .bind(team)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn list(&self) -> Result<Vec<Pipeline>> {
        let rows = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines ORDER BY team, name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_pipeline).collect()
    }

    async fn set_paused(&self, id: PipelineId, paused: bool) -> Result<()> {
        let result = sqlx::query("UPDATE pipelines SET paused = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(paused)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn archive(&self, id: PipelineId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE pipelines SET archived = TRUE, paused = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: PipelineId) -> Result<()> {
        let result = sqlx::query("DELETE FROM pipelines WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn job_state(&self, pipeline_id: PipelineId, job: &str) -> Result<Option<JobState>> {
        self.fetch_job(
            pipeline_id,
            job,
            "SELECT pipeline_id, name, paused, pending_triggers, build_number_seq FROM jobs WHERE pipeline_id = $1 AND name = $2",
        )
        .await
    }

    async fn set_job_paused(&self, pipeline_id: PipelineId, job: &str, paused: bool) -> Result<()> {
        let result = sqlx::query("UPDATE jobs SET paused = $3 WHERE pipeline_id = $1 AND name = $2")
            .bind(pipeline_id.as_uuid())
            .bind(job)
            .bind(paused)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(job.to_string()));
        }
        Ok(())
    }

    async fn request_trigger(&self, pipeline_id: PipelineId, job: &str) -> Result<u32> {
        self.fetch_job(
            pipeline_id,
            job,
            "UPDATE jobs SET pending_triggers = pending_triggers + 1 WHERE pipeline_id = $1 AND name = $2 RETURNING pipeline_id, name, paused, pending_triggers, build_number_seq",
        )
        .await?
        .map(|j| j.pending_triggers)
        .ok_or_else(|| Error::JobNotFound(job.to_string()))
    }

    async fn take_trigger_request(&self, pipeline_id: PipelineId, job: &str) -> Result<bool> {
        let taken = self
            .fetch_job(
                pipeline_id,
                job,
                "UPDATE jobs SET pending_triggers = pending_triggers - 1 WHERE pipeline_id = $1 AND name = $2 AND pending_triggers > 0 RETURNING pipeline_id, name, paused, pending_triggers, build_number_seq",
            )
            .await?;
        Ok(taken.is_some())
    }

    async fn resource_state(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
    ) -> Result<Option<ResourceState>> {
        let row = sqlx::query(
            "SELECT pipeline_id, kind, name, scope_id, pinned_version_id, pin_comment, check_error FROM resources WHERE pipeline_id = $1 AND kind = $2 AND name = $3",
        )
        .bind(pipeline_id.as_uuid())
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_resource).transpose()
    }

    async fn resource_states(&self, pipeline_id: PipelineId) -> Result<Vec<ResourceState>> {
        let rows = sqlx::query(
            "SELECT pipeline_id, kind, name, scope_id, pinned_version_id, pin_comment, check_error FROM resources WHERE pipeline_id = $1 ORDER BY kind, name",
        )
        .bind(pipeline_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_resource).collect()
    }

    async fn set_resource_scope(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
        scope_id: Option<&ScopeId>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resources SET scope_id = $4 WHERE pipeline_id = $1 AND kind = $2 AND name = $3",
        )
        .bind(pipeline_id.as_uuid())
        .bind(kind.as_str())
        .bind(name)
        .bind(scope_id.map(|s| s.as_str()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::ResourceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn set_resource_check_error(
        &self,
        pipeline_id: PipelineId,
        kind: CheckableKind,
        name: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resources SET check_error = $4 WHERE pipeline_id = $1 AND kind = $2 AND name = $3",
        )
        .bind(pipeline_id.as_uuid())
        .bind(kind.as_str())
        .bind(name)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::ResourceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn pin_version(
        &self,
        pipeline_id: PipelineId,
        resource: &str,
        version_id: Option<VersionId>,
        comment: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resources SET pinned_version_id = $3, pin_comment = CASE WHEN $3::uuid IS NULL THEN NULL ELSE $4 END WHERE pipeline_id = $1 AND kind = 'resource' AND name = $2",
        )
        .bind(pipeline_id.as_uuid())
        .bind(resource)
        .bind(version_id.map(|v| *v.as_uuid()))
        .bind(comment)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(d) = &e {
                if d.is_foreign_key_violation() {
                    return Error::VersionNotFound(
                        version_id.map(|v| v.to_string()).unwrap_or_default(),
                    );
                }
            }
            db_err(e)
        })?;
        if result.rows_affected() == 0 {
            return Err(Error::ResourceNotFound(resource.to_string()));
        }
        Ok(())
    }
}
