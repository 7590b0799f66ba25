//! PostgreSQL implementation of EventStore.

use crate::db_err;
use async_trait::async_trait;
use conveyor_core::events::{BuildEvent, EventPayload};
use conveyor_core::ids::BuildId;
use conveyor_core::ports::EventStore;
use conveyor_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, build_id: BuildId, payload: EventPayload) -> Result<BuildEvent> {
        let payload_json = serde_json::to_value(&payload)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // The row lock on the build serializes appenders.
        let row = sqlx::query(
            "UPDATE builds SET next_event_id = next_event_id + 1 WHERE id = $1 AND NOT events_completed RETURNING next_event_id - 1 AS event_id",
        )
        .bind(build_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::Internal(format!("event log of {build_id} is closed or missing")))?;
        let event_id: i64 = row.get("event_id");

        let row = sqlx::query(
            "INSERT INTO build_events (build_id, event_id, payload) VALUES ($1, $2, $3) RETURNING at",
        )
        .bind(build_id.as_uuid())
        .bind(event_id)
        .bind(&payload_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(BuildEvent {
            build_id,
            id: event_id as u64,
            at: row.get("at"),
            payload,
        })
    }

    async fn read(&self, build_id: BuildId, from: u64, limit: usize) -> Result<Vec<BuildEvent>> {
        let rows = sqlx::query(
            "SELECT event_id, at, payload FROM build_events WHERE build_id = $1 AND event_id >= $2 ORDER BY event_id LIMIT $3",
        )
        .bind(build_id.as_uuid())
        .bind(from as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(BuildEvent {
                    build_id,
                    id: r.get::<i64, _>("event_id") as u64,
                    at: r.get("at"),
                    payload: serde_json::from_value(r.get("payload"))?,
                })
            })
            .collect()
    }

    async fn mark_completed(&self, build_id: BuildId) -> Result<()> {
        sqlx::query("UPDATE builds SET events_completed = TRUE WHERE id = $1")
            .bind(build_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn is_completed(&self, build_id: BuildId) -> Result<bool> {
        let row = sqlx::query("SELECT events_completed FROM builds WHERE id = $1")
            .bind(build_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some_and(|r| r.get("events_completed")))
    }
}
