use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use lcbackup_core::{BlobId, CatalogEntryId, CourseId};

use super::{describe, is_unique_violation, like_pattern, PgContext};
use crate::catalog::{CatalogEntry, CatalogFilter, CatalogStore, CatalogStoreError, Page};

const ENTRY_COLUMNS: &str =
    "id, blob_id, course_id, shortname, fullname, filename, size_bytes, content_hash, created_at";

#[derive(Debug, Clone)]
pub struct PostgresCatalogStore {
    cx: PgContext,
}

fn storage(operation: &str, err: sqlx::Error) -> CatalogStoreError {
    CatalogStoreError::Storage(describe(operation, &err))
}

fn entry_from_row(row: &PgRow) -> Result<CatalogEntry, sqlx::Error> {
    let size: i64 = row.try_get("size_bytes")?;
    Ok(CatalogEntry {
        id: CatalogEntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
        blob_id: BlobId::from_uuid(row.try_get::<Uuid, _>("blob_id")?),
        course_id: CourseId::new(row.try_get("course_id")?),
        shortname: row.try_get("shortname")?,
        fullname: row.try_get("fullname")?,
        filename: row.try_get("filename")?,
        size_bytes: u64::try_from(size).unwrap_or_default(),
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Blank name filters match everything.
fn name_filter(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(like_pattern)
}

impl PostgresCatalogStore {
    pub fn new(cx: PgContext) -> Self {
        Self { cx }
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id, course_id = %entry.course_id), err)]
    pub async fn insert_entry(&self, entry: &CatalogEntry) -> Result<(), CatalogStoreError> {
        let size = i64::try_from(entry.size_bytes)
            .map_err(|_| CatalogStoreError::Storage(format!("archive size {} out of range", entry.size_bytes)))?;
        let sql = format!(
            "INSERT INTO lcbackup_catalog ({ENTRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        sqlx::query(&sql)
            .bind(entry.id.as_uuid())
            .bind(entry.blob_id.as_uuid())
            .bind(entry.course_id.get())
            .bind(&entry.shortname)
            .bind(&entry.fullname)
            .bind(&entry.filename)
            .bind(size)
            .bind(&entry.content_hash)
            .bind(entry.created_at)
            .execute(self.cx.pool())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    CatalogStoreError::Duplicate(entry.id)
                } else {
                    storage("insert", e)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_entry(&self, id: CatalogEntryId) -> Result<Option<CatalogEntry>, CatalogStoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM lcbackup_catalog WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(self.cx.pool())
            .await
            .map_err(|e| storage("get", e))?
            .as_ref()
            .map(entry_from_row)
            .transpose()
            .map_err(|e| storage("get", e))
    }

    #[instrument(skip(self), err)]
    pub async fn list_entries(
        &self,
        filter: &CatalogFilter,
        page: Page,
    ) -> Result<Vec<CatalogEntry>, CatalogStoreError> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM lcbackup_catalog
            WHERE ($1::BIGINT IS NULL OR course_id = $1)
              AND ($2::TEXT IS NULL OR shortname ILIKE $2)
              AND ($3::TEXT IS NULL OR fullname ILIKE $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.course_id.map(CourseId::get))
            .bind(name_filter(&filter.shortname))
            .bind(name_filter(&filter.fullname))
            .bind(page.limit as i64)
            .bind(i64::try_from(page.offset).unwrap_or(i64::MAX))
            .fetch_all(self.cx.pool())
            .await
            .map_err(|e| storage("list", e))?;
        rows.iter()
            .map(entry_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| storage("list", e))
    }

    #[instrument(skip(self), err)]
    pub async fn delete_entry(&self, id: CatalogEntryId) -> Result<bool, CatalogStoreError> {
        let result = sqlx::query("DELETE FROM lcbackup_catalog WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.cx.pool())
            .await
            .map_err(|e| storage("delete", e))?;
        Ok(result.rows_affected() > 0)
    }
}

impl CatalogStore for PostgresCatalogStore {
    fn insert(&self, entry: &CatalogEntry) -> Result<(), CatalogStoreError> {
        self.cx.block_on(self.insert_entry(entry))
    }

    fn get(&self, id: CatalogEntryId) -> Result<Option<CatalogEntry>, CatalogStoreError> {
        self.cx.block_on(self.get_entry(id))
    }

    fn list(&self, filter: &CatalogFilter, page: Page) -> Result<Vec<CatalogEntry>, CatalogStoreError> {
        self.cx.block_on(self.list_entries(filter, page))
    }

    fn delete(&self, id: CatalogEntryId) -> Result<bool, CatalogStoreError> {
        self.cx.block_on(self.delete_entry(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_name_filters_are_dropped() {
        assert_eq!(name_filter(&None), None);
        assert_eq!(name_filter(&Some("  ".to_string())), None);
        assert_eq!(name_filter(&Some(" bio ".to_string())).as_deref(), Some("%bio%"));
    }
}
