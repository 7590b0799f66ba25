//! PostgreSQL implementation of BuildRepository.

use crate::db_err;
use async_trait::async_trait;
use conveyor_core::build::{Build, BuildInput, BuildOutput, BuildStatus, BuildVersions, NewBuild};
use conveyor_core::ids::{BuildId, PipelineId, VersionId};
use conveyor_core::plan::Plan;
use conveyor_core::ports::BuildRepository;
use conveyor_core::{Error, Result};
use sqlx::{PgPool, Row};

const BUILD_COLUMNS: &str = "id, team, pipeline_id, job, number, status, plan, manually_triggered, abort_requested, created_at, started_at, finished_at";

pub struct PgBuildRepository {
    pool: PgPool,
}

impl PgBuildRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_build(r: &sqlx::postgres::PgRow) -> Result<Build> {
        let status: String = r.get("status");
        let plan: Option<Plan> = r
            .get::<Option<serde_json::Value>, _>("plan")
            .map(serde_json::from_value)
            .transpose()?;
        Ok(Build {
            id: BuildId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            team: r.get("team"),
            pipeline_id: r
                .get::<Option<uuid::Uuid>, _>("pipeline_id")
                .map(PipelineId::from_uuid),
            job: r.get("job"),
            number: r.get::<Option<i64>, _>("number").map(|n| n as u64),
            status: BuildStatus::parse(&status)
                .ok_or_else(|| Error::Database(format!("unknown build status: {status}")))?,
            plan,
            manually_triggered: r.get("manually_triggered"),
            abort_requested: r.get("abort_requested"),
            created_at: r.get("created_at"),
            started_at: r.get("started_at"),
            finished_at: r.get("finished_at"),
        })
    }

    async fn fetch_builds(&self, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> Result<Vec<Build>> {
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(Self::row_to_build).collect()
    }
}

#[async_trait]
impl BuildRepository for PgBuildRepository {
    async fn create(&self, new: NewBuild) -> Result<Build> {
        let plan_json = new.plan.as_ref().map(serde_json::to_value).transpose()?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let number: Option<i64> = match (new.pipeline_id, new.job.as_deref()) {
            (Some(pipeline_id), Some(job)) => {
                let row = sqlx::query(
                    "UPDATE jobs SET build_number_seq = build_number_seq + 1 WHERE pipeline_id = $1 AND name = $2 RETURNING build_number_seq",
                )
                .bind(pipeline_id.as_uuid())
                .bind(job)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| Error::JobNotFound(job.to_string()))?;
                Some(row.get("build_number_seq"))
            }
            _ => None,
        };

        let row = sqlx::query(&format!(
            "INSERT INTO builds (id, team, pipeline_id, job, number, status, plan, manually_triggered) VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7) RETURNING {BUILD_COLUMNS}"
        ))
        .bind(BuildId::new().as_uuid())
        .bind(&new.team)
        .bind(new.pipeline_id.map(|p| *p.as_uuid()))
        .bind(&new.job)
        .bind(number)
        .bind(&plan_json)
        .bind(new.manually_triggered)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let build = Self::row_to_build(&row)?;

        for input in &new.inputs {
            sqlx::query(
                "INSERT INTO build_inputs (build_id, name, resource, version_id, first_occurrence) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(build.id.as_uuid())
            .bind(&input.name)
            .bind(&input.resource)
            .bind(input.version_id.as_uuid())
            .bind(input.first_occurrence)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(build)
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        let row = sqlx::query(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_build).transpose()
    }

    async fn list_for_job(&self, pipeline_id: PipelineId, job: &str, limit: usize) -> Result<Vec<Build>> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE pipeline_id = $1 AND job = $2 ORDER BY seq DESC LIMIT $3"
        );
        self.fetch_builds(
            sqlx::query(&sql)
                .bind(*pipeline_id.as_uuid())
                .bind(job.to_string())
                .bind(limit as i64),
        )
        .await
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Build>> {
        let sql = format!("SELECT {BUILD_COLUMNS} FROM builds ORDER BY seq DESC LIMIT $1");
        self.fetch_builds(sqlx::query(&sql).bind(limit as i64)).await
    }

    async fn active_for_job(&self, pipeline_id: PipelineId, job: &str) -> Result<Vec<Build>> {
        let sql = format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE pipeline_id = $1 AND job = $2 AND status IN ('pending', 'started') ORDER BY seq DESC"
        );
        self.fetch_builds(
            sqlx::query(&sql)
                .bind(*pipeline_id.as_uuid())
                .bind(job.to_string()),
        )
        .await
    }

    async fn list_by_status(&self, status: BuildStatus) -> Result<Vec<Build>> {
        let sql = format!("SELECT {BUILD_COLUMNS} FROM builds WHERE status = $1 ORDER BY seq");
        self.fetch_builds(sqlx::query(&sql).bind(status.as_str())).await
    }

    async fn transition(&self, id: BuildId, from: BuildStatus, to: BuildStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE builds SET status = $3,
                   started_at = CASE WHEN $3 = 'started' THEN NOW() ELSE started_at END,
                   finished_at = CASE WHEN $4 THEN NOW() ELSE finished_at END
               WHERE id = $1 AND status = $2"#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn request_abort(&self, id: BuildId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds SET abort_requested = TRUE WHERE id = $1 AND status IN ('pending', 'started')",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_output(&self, id: BuildId, output: &BuildOutput) -> Result<()> {
        sqlx::query(
            "INSERT INTO build_outputs (build_id, name, resource, version_id) VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
        )
        .bind(id.as_uuid())
        .bind(&output.name)
        .bind(&output.resource)
        .bind(output.version_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn inputs(&self, id: BuildId) -> Result<Vec<BuildInput>> {
        let rows = sqlx::query(
            "SELECT name, resource, version_id, first_occurrence FROM build_inputs WHERE build_id = $1 ORDER BY name",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| BuildInput {
                name: r.get("name"),
                resource: r.get("resource"),
                version_id: VersionId::from_uuid(r.get::<uuid::Uuid, _>("version_id")),
                first_occurrence: r.get("first_occurrence"),
            })
            .collect())
    }

    async fn outputs(&self, id: BuildId) -> Result<Vec<BuildOutput>> {
        let rows = sqlx::query(
            "SELECT name, resource, version_id FROM build_outputs WHERE build_id = $1 ORDER BY name",
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|r| BuildOutput {
                name: r.get("name"),
                resource: r.get("resource"),
                version_id: VersionId::from_uuid(r.get::<uuid::Uuid, _>("version_id")),
            })
            .collect())
    }

    async fn succeeded_build_versions(&self, pipeline_id: PipelineId, job: &str) -> Result<Vec<BuildVersions>> {
        let rows = sqlx::query(
            r#"SELECT b.id, b.seq, v.resource, v.version_id FROM builds b
               JOIN (
                   SELECT build_id, resource, version_id FROM build_inputs
                   UNION ALL
                   SELECT build_id, resource, version_id FROM build_outputs
               ) v ON v.build_id = b.id
               WHERE b.pipeline_id = $1 AND b.job = $2 AND b.status = 'succeeded'
               ORDER BY b.seq DESC"#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut builds: Vec<BuildVersions> = Vec::new();
        for r in &rows {
            let build_id = BuildId::from_uuid(r.get::<uuid::Uuid, _>("id"));
            let entry = (
                r.get::<String, _>("resource"),
                VersionId::from_uuid(r.get::<uuid::Uuid, _>("version_id")),
            );
            match builds.last_mut() {
                Some(last) if last.build_id == build_id => last.versions.push(entry),
                _ => builds.push(BuildVersions {
                    build_id,
                    versions: vec![entry],
                }),
            }
        }
        Ok(builds)
    }

    async fn version_used(
        &self,
        pipeline_id: PipelineId,
        job: &str,
        input: &str,
        version: VersionId,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"SELECT EXISTS (
                   SELECT 1 FROM build_inputs i JOIN builds b ON b.id = i.build_id
                   WHERE b.pipeline_id = $1 AND b.job = $2 AND i.name = $3 AND i.version_id = $4
               ) AS used"#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(job)
        .bind(input)
        .bind(version.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.get("used"))
    }

    async fn last_used_version(&self, pipeline_id: PipelineId, job: &str, input: &str) -> Result<Option<VersionId>> {
        let row = sqlx::query(
            r#"SELECT i.version_id FROM build_inputs i JOIN builds b ON b.id = i.build_id
               WHERE b.pipeline_id = $1 AND b.job = $2 AND i.name = $3
               ORDER BY b.seq DESC LIMIT 1"#,
        )
        .bind(pipeline_id.as_uuid())
        .bind(job)
        .bind(input)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|r| VersionId::from_uuid(r.get::<uuid::Uuid, _>("version_id"))))
    }
}
