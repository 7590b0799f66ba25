//! Session-level PostgreSQL advisory locks.

use crate::db_err;
use async_trait::async_trait;
use conveyor_core::lock::LockId;
use conveyor_core::ports::{Lock, LockFactory};
use conveyor_core::Result;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tracing::warn;

pub struct PgLockFactory {
    pool: PgPool,
}

impl PgLockFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Holds the connection that owns the advisory lock.
struct PgLock {
    id: LockId,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl Lock for PgLock {
    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.id.key())
                .execute(&mut *conn)
                .await;
            if unlocked.is_err() {
                conn.close_on_drop();
            }
            unlocked.map_err(db_err)?;
        }
        Ok(())
    }
}

impl Drop for PgLock {
    fn drop(&mut self) {
        // The session lock dies with its connection.
        if let Some(mut conn) = self.conn.take() {
            warn!(lock = %self.id, "advisory lock dropped without release, closing connection");
            conn.close_on_drop();
        }
    }
}

#[async_trait]
impl LockFactory for PgLockFactory {
    async fn try_acquire(&self, id: &LockId) -> Result<Option<Box<dyn Lock>>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        let acquired: bool = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(id.key())
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?
            .get("acquired");
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Box::new(PgLock {
            id: id.clone(),
            conn: Some(conn),
        })))
    }
}
