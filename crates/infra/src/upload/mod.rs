//! Archive upload to a remote object store, with a durable audit trail.

mod records;
mod remote;
mod s3;

pub use records::{InMemoryUploadRecordStore, UploadRecord, UploadRecordError, UploadRecordStore};
pub use remote::{InMemoryRemoteStore, InMemoryRemoteStoreFactory, RemoteError, RemoteStore, RemoteStoreFactory};
pub use s3::{S3RemoteStore, S3RemoteStoreFactory};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use lcbackup_core::{Deadline, S3Settings, StepSettings};

use crate::archive::Archive;
use crate::jobs::Job;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// No remote store applies to the request.
    #[error("upload not configured: {0}")]
    NotConfigured(String),
    /// The connectivity check failed; nothing was transferred.
    #[error("remote store unreachable: {0}")]
    RemoteUnreachable(String),
    #[error("transfer error: {0}")]
    TransferError(String),
    #[error(transparent)]
    Records(#[from] UploadRecordError),
}

/// Result of a manual connectivity check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub success: bool,
    pub bucket: String,
    pub details: String,
}

/// A bucket client plus the key prefix of the objects written to it.
struct RemoteTarget {
    store: Arc<dyn RemoteStore>,
    key_prefix: String,
}

impl RemoteTarget {
    fn key(&self, filename: &str) -> String {
        format!("{}{}", self.key_prefix, filename)
    }
}

/// Uploads archives to the remote of the job's step instance, or to the
/// deployment default when the instance names none.
pub struct UploadService {
    default: Option<RemoteTarget>,
    factory: Option<Arc<dyn RemoteStoreFactory>>,
    records: Arc<dyn UploadRecordStore>,
}

impl UploadService {
    /// Service with a default remote only.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        records: Arc<dyn UploadRecordStore>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            default: Some(RemoteTarget {
                store: remote,
                key_prefix: key_prefix.into(),
            }),
            factory: None,
            records,
        }
    }

    /// Service that only serves instances carrying their own remote.
    pub fn per_instance(factory: Arc<dyn RemoteStoreFactory>, records: Arc<dyn UploadRecordStore>) -> Self {
        Self {
            default: None,
            factory: Some(factory),
            records,
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn RemoteStoreFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn records(&self) -> &Arc<dyn UploadRecordStore> {
        &self.records
    }

    pub fn default_bucket(&self) -> Option<&str> {
        self.default.as_ref().map(|target| target.store.bucket())
    }

    /// Whether a job with `settings` has somewhere to upload to.
    pub fn accepts(&self, settings: &StepSettings) -> bool {
        match settings.remote {
            Some(_) => self.factory.is_some(),
            None => self.default.is_some(),
        }
    }

    fn target(&self, remote: Option<&S3Settings>) -> Result<RemoteTarget, UploadError> {
        match remote {
            Some(settings) => {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    UploadError::NotConfigured("step instance remotes are not supported here".to_string())
                })?;
                let store = factory
                    .open(settings)
                    .map_err(|e| UploadError::NotConfigured(e.to_string()))?;
                Ok(RemoteTarget {
                    store,
                    key_prefix: settings.key_prefix.clone(),
                })
            }
            None => self
                .default
                .as_ref()
                .map(|target| RemoteTarget {
                    store: target.store.clone(),
                    key_prefix: target.key_prefix.clone(),
                })
                .ok_or_else(|| UploadError::NotConfigured("no default remote store".to_string())),
        }
    }

    /// Upload the archive of `job` and record it.
    ///
    /// A job that already has a record is not uploaded again.
    pub fn upload(
        &self,
        job: &Job,
        archive: &Archive,
        content: Bytes,
        deadline: Deadline,
    ) -> Result<UploadRecord, UploadError> {
        if let Some(existing) = self.records.get(job.id)? {
            warn!(job_id = %job.id, "job already uploaded, keeping existing record");
            return Ok(existing);
        }

        let target = self.target(job.payload.settings.remote.as_ref())?;
        target
            .store
            .head_bucket(deadline)
            .map_err(|e| UploadError::RemoteUnreachable(e.to_string()))?;

        let remote_key = target.key(&archive.filename);
        target
            .store
            .put_object(&remote_key, content, deadline)
            .map_err(|e| UploadError::TransferError(e.to_string()))?;

        let record = UploadRecord {
            job_id: job.id,
            process_id: job.payload.process_id,
            instance_id: job.payload.instance_id,
            course_id: archive.source_course_id,
            filename: archive.filename.clone(),
            archive_content_hash: archive.content_hash.clone(),
            remote_bucket: target.store.bucket().to_string(),
            remote_key,
            uploaded_at: Utc::now(),
        };
        if !self.records.insert(record.clone())? {
            if let Some(existing) = self.records.get(job.id)? {
                return Ok(existing);
            }
        }
        info!(
            job_id = %job.id,
            course_id = %record.course_id,
            bucket = %record.remote_bucket,
            key = %record.remote_key,
            "archive uploaded"
        );
        Ok(record)
    }

    /// Check `remote`, or the default remote when `None`.
    pub fn check_connection(
        &self,
        remote: Option<&S3Settings>,
        timeout: Duration,
    ) -> Result<ConnectionStatus, UploadError> {
        let target = self.target(remote)?;
        let bucket = target.store.bucket().to_string();
        Ok(match target.store.head_bucket(Deadline::after(timeout)) {
            Ok(()) => ConnectionStatus {
                success: true,
                details: format!("connected to bucket {bucket}"),
                bucket,
            },
            Err(e) => ConnectionStatus {
                success: false,
                details: e.to_string(),
                bucket,
            },
        })
    }
}
