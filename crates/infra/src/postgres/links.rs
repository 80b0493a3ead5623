use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use lcbackup_core::{JobId, ProcessId};

use super::{describe, PgContext};
use crate::process::{ProcessLink, ProcessLinkError, ProcessLinkStore};

#[derive(Debug, Clone)]
pub struct PostgresProcessLinkStore {
    cx: PgContext,
}

fn storage(operation: &str, err: sqlx::Error) -> ProcessLinkError {
    ProcessLinkError::Storage(describe(operation, &err))
}

fn link_from_row(row: &PgRow) -> Result<ProcessLink, sqlx::Error> {
    Ok(ProcessLink {
        process_id: ProcessId::new(row.try_get("process_id")?),
        job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id")?),
        created_at: row.try_get("created_at")?,
    })
}

impl PostgresProcessLinkStore {
    pub fn new(cx: PgContext) -> Self {
        Self { cx }
    }

    #[instrument(skip(self), fields(process_id = %link.process_id, job_id = %link.job_id), err)]
    pub async fn insert_link(&self, link: &ProcessLink) -> Result<bool, ProcessLinkError> {
        let result = sqlx::query(
            r#"
            INSERT INTO lcbackup_process_links (process_id, job_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (process_id) DO NOTHING
            "#,
        )
        .bind(link.process_id.get())
        .bind(link.job_id.as_uuid())
        .bind(link.created_at)
        .execute(self.cx.pool())
        .await
        .map_err(|e| storage("insert", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    pub async fn get_link(&self, process_id: ProcessId) -> Result<Option<ProcessLink>, ProcessLinkError> {
        sqlx::query("SELECT process_id, job_id, created_at FROM lcbackup_process_links WHERE process_id = $1")
            .bind(process_id.get())
            .fetch_optional(self.cx.pool())
            .await
            .map_err(|e| storage("get", e))?
            .as_ref()
            .map(link_from_row)
            .transpose()
            .map_err(|e| storage("get", e))
    }

    #[instrument(skip(self), err)]
    pub async fn delete_link(&self, process_id: ProcessId) -> Result<bool, ProcessLinkError> {
        let result = sqlx::query("DELETE FROM lcbackup_process_links WHERE process_id = $1")
            .bind(process_id.get())
            .execute(self.cx.pool())
            .await
            .map_err(|e| storage("delete", e))?;
        Ok(result.rows_affected() > 0)
    }
}

impl ProcessLinkStore for PostgresProcessLinkStore {
    fn insert(&self, link: ProcessLink) -> Result<bool, ProcessLinkError> {
        self.cx.block_on(self.insert_link(&link))
    }

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessLink>, ProcessLinkError> {
        self.cx.block_on(self.get_link(process_id))
    }

    fn delete(&self, process_id: ProcessId) -> Result<bool, ProcessLinkError> {
        self.cx.block_on(self.delete_link(process_id))
    }
}
