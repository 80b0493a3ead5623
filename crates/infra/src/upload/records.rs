use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lcbackup_core::{CourseId, JobId, ProcessId, StepInstanceId};

/// Audit row of one successful upload. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub job_id: JobId,
    pub process_id: ProcessId,
    pub instance_id: StepInstanceId,
    pub course_id: CourseId,
    pub filename: String,
    pub archive_content_hash: String,
    pub remote_bucket: String,
    pub remote_key: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadRecordError {
    #[error("upload record storage error: {0}")]
    Storage(String),
}

/// Append-only store, at most one record per job.
pub trait UploadRecordStore: Send + Sync {
    /// Returns `false` when the job already has a record; nothing is written then.
    fn insert(&self, record: UploadRecord) -> Result<bool, UploadRecordError>;

    fn get(&self, job_id: JobId) -> Result<Option<UploadRecord>, UploadRecordError>;

    /// Newest first.
    fn list_for_course(&self, course_id: CourseId) -> Result<Vec<UploadRecord>, UploadRecordError>;
}

#[derive(Debug, Default)]
pub struct InMemoryUploadRecordStore {
    records: RwLock<Vec<UploadRecord>>,
}

impl InMemoryUploadRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> UploadRecordError {
    UploadRecordError::Storage("upload record lock poisoned".to_string())
}

impl UploadRecordStore for InMemoryUploadRecordStore {
    fn insert(&self, record: UploadRecord) -> Result<bool, UploadRecordError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        if records.iter().any(|r| r.job_id == record.job_id) {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    fn get(&self, job_id: JobId) -> Result<Option<UploadRecord>, UploadRecordError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.iter().find(|r| r.job_id == job_id).cloned())
    }

    fn list_for_course(&self, course_id: CourseId) -> Result<Vec<UploadRecord>, UploadRecordError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.course_id == course_id)
            .cloned()
            .collect())
    }
}
