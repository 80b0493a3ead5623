use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use lcbackup_core::{CourseId, JobId, ProcessId, StepInstanceId};

use super::{describe, PgContext};
use crate::upload::{UploadRecord, UploadRecordError, UploadRecordStore};

const RECORD_COLUMNS: &str = "job_id, process_id, instance_id, course_id, filename, \
     archive_content_hash, remote_bucket, remote_key, uploaded_at";

#[derive(Debug, Clone)]
pub struct PostgresUploadRecordStore {
    cx: PgContext,
}

fn storage(operation: &str, err: sqlx::Error) -> UploadRecordError {
    UploadRecordError::Storage(describe(operation, &err))
}

fn record_from_row(row: &PgRow) -> Result<UploadRecord, sqlx::Error> {
    Ok(UploadRecord {
        job_id: JobId::from_uuid(row.try_get::<Uuid, _>("job_id")?),
        process_id: ProcessId::new(row.try_get("process_id")?),
        instance_id: StepInstanceId::new(row.try_get("instance_id")?),
        course_id: CourseId::new(row.try_get("course_id")?),
        filename: row.try_get("filename")?,
        archive_content_hash: row.try_get("archive_content_hash")?,
        remote_bucket: row.try_get("remote_bucket")?,
        remote_key: row.try_get("remote_key")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

impl PostgresUploadRecordStore {
    pub fn new(cx: PgContext) -> Self {
        Self { cx }
    }

    #[instrument(skip(self, record), fields(job_id = %record.job_id), err)]
    pub async fn insert_record(&self, record: &UploadRecord) -> Result<bool, UploadRecordError> {
        let sql = format!(
            "INSERT INTO lcbackup_upload_records ({RECORD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (job_id) DO NOTHING"
        );
        let result = sqlx::query(&sql)
            .bind(record.job_id.as_uuid())
            .bind(record.process_id.get())
            .bind(record.instance_id.get())
            .bind(record.course_id.get())
            .bind(&record.filename)
            .bind(&record.archive_content_hash)
            .bind(&record.remote_bucket)
            .bind(&record.remote_key)
            .bind(record.uploaded_at)
            .execute(self.cx.pool())
            .await
            .map_err(|e| storage("insert", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    pub async fn get_record(&self, job_id: JobId) -> Result<Option<UploadRecord>, UploadRecordError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM lcbackup_upload_records WHERE job_id = $1");
        sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(self.cx.pool())
            .await
            .map_err(|e| storage("get", e))?
            .as_ref()
            .map(record_from_row)
            .transpose()
            .map_err(|e| storage("get", e))
    }

    #[instrument(skip(self), err)]
    pub async fn records_for_course(&self, course_id: CourseId) -> Result<Vec<UploadRecord>, UploadRecordError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM lcbackup_upload_records \
             WHERE course_id = $1 ORDER BY uploaded_at DESC, job_id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(course_id.get())
            .fetch_all(self.cx.pool())
            .await
            .map_err(|e| storage("list_for_course", e))?;
        rows.iter()
            .map(record_from_row)
            .collect::<Result<_, _>>()
            .map_err(|e| storage("list_for_course", e))
    }
}

impl UploadRecordStore for PostgresUploadRecordStore {
    fn insert(&self, record: UploadRecord) -> Result<bool, UploadRecordError> {
        self.cx.block_on(self.insert_record(&record))
    }

    fn get(&self, job_id: JobId) -> Result<Option<UploadRecord>, UploadRecordError> {
        self.cx.block_on(self.get_record(job_id))
    }

    fn list_for_course(&self, course_id: CourseId) -> Result<Vec<UploadRecord>, UploadRecordError> {
        self.cx.block_on(self.records_for_course(course_id))
    }
}
