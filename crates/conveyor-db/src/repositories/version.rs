//! PostgreSQL implementation of VersionStore.

use crate::db_err;
use async_trait::async_trait;
use conveyor_core::ids::{ScopeId, VersionId};
use conveyor_core::ports::VersionStore;
use conveyor_core::version::{
    version_digest, MetadataField, ResourceScope, ResourceVersion, ScopeSpec, Version,
};
use conveyor_core::{Error, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;

const VERSION_COLUMNS: &str =
    "id, scope_id, version, digest, metadata, check_order, enabled, created_at";

pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_scope(r: &sqlx::postgres::PgRow) -> Result<ResourceScope> {
        Ok(ResourceScope {
            id: ScopeId::new(r.get::<String, _>("id")),
            spec: serde_json::from_value(r.get("spec"))?,
            last_check_started: r.get("last_check_started"),
            last_check_finished: r.get("last_check_finished"),
            check_error: r.get("check_error"),
        })
    }

    fn row_to_version(r: &sqlx::postgres::PgRow) -> Result<ResourceVersion> {
        Ok(ResourceVersion {
            id: VersionId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            scope_id: ScopeId::new(r.get::<String, _>("scope_id")),
            version: serde_json::from_value(r.get("version"))?,
            digest: r.get("digest"),
            metadata: serde_json::from_value(r.get("metadata"))?,
            check_order: r.get("check_order"),
            enabled: r.get("enabled"),
            created_at: r.get("created_at"),
        })
    }

    /// Lock the scope row so concurrent inserters serialize on check order.
    async fn lock_scope(tx: &mut Transaction<'_, Postgres>, scope: &ScopeId) -> Result<()> {
        sqlx::query("SELECT id FROM resource_config_scopes WHERE id = $1 FOR UPDATE")
            .bind(scope.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::ScopeNotFound(scope.to_string()))?;
        Ok(())
    }

    async fn insert_version(
        tx: &mut Transaction<'_, Postgres>,
        scope: &ScopeId,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<(ResourceVersion, bool)> {
        let digest = version_digest(version);
        let existing = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE scope_id = $1 AND digest = $2"
        ))
        .bind(scope.as_str())
        .bind(&digest)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        if let Some(row) = existing {
            return Ok((Self::row_to_version(&row)?, false));
        }

        let order: i64 = sqlx::query(
            "UPDATE resource_config_scopes SET check_order_seq = check_order_seq + 1 WHERE id = $1 RETURNING check_order_seq",
        )
        .bind(scope.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?
        .get("check_order_seq");

        let row = sqlx::query(&format!(
            "INSERT INTO resource_config_versions (id, scope_id, version, digest, metadata, check_order) VALUES ($1, $2, $3, $4, $5, $6) RETURNING {VERSION_COLUMNS}"
        ))
        .bind(VersionId::new().as_uuid())
        .bind(scope.as_str())
        .bind(serde_json::to_value(version)?)
        .bind(&digest)
        .bind(serde_json::to_value(metadata)?)
        .bind(order)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok((Self::row_to_version(&row)?, true))
    }

    async fn fetch_version(&self, sql: &str, scope: &ScopeId) -> Result<Option<ResourceVersion>> {
        let row = sqlx::query(sql)
            .bind(scope.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_version).transpose()
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn find_or_create_scope(&self, spec: &ScopeSpec) -> Result<ResourceScope> {
        let id = spec.id();
        sqlx::query("INSERT INTO resource_config_scopes (id, spec) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(id.as_str())
            .bind(serde_json::to_value(spec)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        self.get_scope(&id)
            .await?
            .ok_or_else(|| Error::ScopeNotFound(id.to_string()))
    }

    async fn get_scope(&self, id: &ScopeId) -> Result<Option<ResourceScope>> {
        let row = sqlx::query(
            "SELECT id, spec, last_check_started, last_check_finished, check_error FROM resource_config_scopes WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_scope).transpose()
    }

    async fn save_versions(&self, scope: &ScopeId, versions: &[Version]) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_scope(&mut tx, scope).await?;
        let mut inserted = 0;
        for version in versions {
            if Self::insert_version(&mut tx, scope, version, &[]).await?.1 {
                inserted += 1;
            }
        }
        tx.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn save_version(
        &self,
        scope: &ScopeId,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<ResourceVersion> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::lock_scope(&mut tx, scope).await?;
        let (row, _) = Self::insert_version(&mut tx, scope, version, metadata).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(row)
    }

    async fn versions(&self, scope: &ScopeId, limit: Option<usize>) -> Result<Vec<ResourceVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE scope_id = $1 ORDER BY check_order DESC LIMIT $2"
        ))
        .bind(scope.as_str())
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::row_to_version).collect()
    }

    async fn latest_version(&self, scope: &ScopeId) -> Result<Option<ResourceVersion>> {
        self.fetch_version(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE scope_id = $1 ORDER BY check_order DESC LIMIT 1"
            ),
            scope,
        )
        .await
    }

    async fn latest_enabled(&self, scope: &ScopeId) -> Result<Option<ResourceVersion>> {
        self.fetch_version(
            &format!(
                "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE scope_id = $1 AND enabled ORDER BY check_order DESC LIMIT 1"
            ),
            scope,
        )
        .await
    }

    async fn find_version(&self, scope: &ScopeId, version: &Version) -> Result<Option<ResourceVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE scope_id = $1 AND digest = $2"
        ))
        .bind(scope.as_str())
        .bind(version_digest(version))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn get_version(&self, id: VersionId) -> Result<Option<ResourceVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::row_to_version).transpose()
    }

    async fn set_version_enabled(&self, id: VersionId, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE resource_config_versions SET enabled = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::VersionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn clear_versions(&self, scope: &ScopeId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "UPDATE resources SET pin_comment = NULL WHERE pinned_version_id IN (SELECT id FROM resource_config_versions WHERE scope_id = $1)",
        )
        .bind(scope.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        // Pins are nulled and build inputs/outputs cascade through foreign keys.
        let result = sqlx::query("DELETE FROM resource_config_versions WHERE scope_id = $1")
            .bind(scope.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn try_claim_check(&self, scope: &ScopeId, interval: Duration, immediate: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resource_config_scopes SET last_check_started = NOW() WHERE id = $1 AND ($3 OR last_check_started IS NULL OR last_check_started <= NOW() - make_interval(secs => $2))",
        )
        .bind(scope.as_str())
        .bind(interval.as_secs_f64())
        .bind(immediate)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_scope(scope).await? {
            Some(_) => Ok(false),
            None => Err(Error::ScopeNotFound(scope.to_string())),
        }
    }

    async fn record_check_result(&self, scope: &ScopeId, error: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resource_config_scopes SET last_check_finished = NOW(), check_error = $2 WHERE id = $1",
        )
        .bind(scope.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::ScopeNotFound(scope.to_string()));
        }
        Ok(())
    }
}
