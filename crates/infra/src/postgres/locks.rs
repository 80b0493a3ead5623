use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;

use lcbackup_core::CourseId;

use super::{describe, PgContext};
use crate::jobs::lock::expiry;
use crate::jobs::{ExclusivityLock, LockError};

/// Lease rows in `lcbackup_locks`. An expired lease is overwritten in place.
#[derive(Debug, Clone)]
pub struct PostgresExclusivityLock {
    cx: PgContext,
}

fn storage(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Storage(describe(operation, &err))
}

impl PostgresExclusivityLock {
    pub fn new(cx: PgContext) -> Self {
        Self { cx }
    }

    #[instrument(skip(self), err)]
    pub async fn acquire_lease(
        &self,
        key: CourseId,
        holder_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, LockError> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO lcbackup_locks (resource_key, holder_id, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_key) DO UPDATE
                SET holder_id = EXCLUDED.holder_id, expires_at = EXCLUDED.expires_at
                WHERE lcbackup_locks.expires_at <= $4
            RETURNING holder_id
            "#,
        )
        .bind(key.get())
        .bind(holder_id)
        .bind(expires_at)
        .bind(now)
        .fetch_optional(self.cx.pool())
        .await
        .map_err(|e| storage("try_acquire", e))?;
        Ok(acquired.is_some())
    }

    #[instrument(skip(self), err)]
    pub async fn release_lease(&self, key: CourseId, holder_id: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM lcbackup_locks WHERE resource_key = $1 AND holder_id = $2")
            .bind(key.get())
            .bind(holder_id)
            .execute(self.cx.pool())
            .await
            .map_err(|e| storage("release", e))?;
        Ok(())
    }
}

impl ExclusivityLock for PostgresExclusivityLock {
    fn try_acquire(&self, key: CourseId, holder_id: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        self.cx
            .block_on(self.acquire_lease(key, holder_id, expiry(now, ttl), now))
    }

    fn release(&self, key: CourseId, holder_id: &str) -> Result<(), LockError> {
        self.cx.block_on(self.release_lease(key, holder_id))
    }
}
