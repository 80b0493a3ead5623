//! The face the host workflow engine sees.
//!
//! A process asks for a backup and gets `waiting` back at once; later polls
//! turn job state into `proceed`, `waiting` or `failed`.

mod links;

pub use links::{InMemoryProcessLinkStore, ProcessLink, ProcessLinkError, ProcessLinkStore};

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use lcbackup_core::{CourseId, JobId, ProcessId};

use crate::jobs::{JobPayload, JobQueue, JobQueueError, JobStatus};
use crate::upload::UploadService;

/// Answer handed back to the workflow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "lowercase")]
pub enum StepResponse {
    Proceed,
    Waiting,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRequested {
    pub job_id: JobId,
    #[serde(flatten)]
    pub response: StepResponse,
    /// The process already had a live job; no new one was queued.
    pub existing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Queue(JobQueueError),
    #[error(transparent)]
    Links(#[from] ProcessLinkError),
}

impl From<JobQueueError> for BridgeError {
    fn from(value: JobQueueError) -> Self {
        match value {
            JobQueueError::InvalidPayload(msg) => Self::InvalidPayload(msg),
            other => Self::Queue(other),
        }
    }
}

pub struct ProcessStateBridge {
    queue: Arc<dyn JobQueue>,
    links: Arc<dyn ProcessLinkStore>,
    upload: Option<Arc<UploadService>>,
}

impl ProcessStateBridge {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        links: Arc<dyn ProcessLinkStore>,
        upload: Option<Arc<UploadService>>,
    ) -> Self {
        Self { queue, links, upload }
    }

    pub fn enqueue_backup(
        &self,
        process_id: ProcessId,
        resource_key: CourseId,
        payload: JobPayload,
    ) -> Result<BackupRequested, BridgeError> {
        if payload.process_id != process_id {
            return Err(BridgeError::InvalidPayload(format!(
                "payload belongs to process {}, not {}",
                payload.process_id, process_id
            )));
        }
        if payload.wants_upload() && !self.upload.as_ref().is_some_and(|u| u.accepts(&payload.settings)) {
            return Err(BridgeError::InvalidPayload(
                "upload requested but no remote store applies to this step instance".to_string(),
            ));
        }

        if let Some(link) = self.links.get(process_id)? {
            match self.queue.get(link.job_id)? {
                Some(job) if !job.status.is_terminal() => {
                    debug!(process_id = %process_id, job_id = %job.id, "backup already queued");
                    return Ok(waiting(job.id, true));
                }
                _ => {
                    self.links.delete(process_id)?;
                }
            }
        }

        let job_id = self.queue.enqueue(resource_key, payload, Utc::now())?;
        if !self.links.insert(ProcessLink::new(process_id, job_id))? {
            // Another request for the same process won. A runner may already
            // hold our job; then it runs to completion unlinked.
            if !self.queue.cancel(job_id)? {
                warn!(process_id = %process_id, job_id = %job_id, "duplicate job already claimed");
            }
            let link = self.links.get(process_id)?.ok_or_else(|| {
                ProcessLinkError::Storage(format!("link of process {process_id} changed concurrently"))
            })?;
            return Ok(waiting(link.job_id, true));
        }

        info!(process_id = %process_id, course_id = %resource_key, job_id = %job_id, "backup queued");
        Ok(waiting(job_id, false))
    }

    pub fn poll_backup(&self, process_id: ProcessId) -> Result<StepResponse, BridgeError> {
        let Some(link) = self.links.get(process_id)? else {
            return Ok(StepResponse::Proceed);
        };
        let Some(job) = self.queue.get(link.job_id)? else {
            self.links.delete(process_id)?;
            return Ok(StepResponse::Proceed);
        };

        match job.status {
            JobStatus::Pending | JobStatus::Running => Ok(StepResponse::Waiting),
            JobStatus::Succeeded => {
                self.links.delete(process_id)?;
                Ok(StepResponse::Proceed)
            }
            JobStatus::Failed { reason } => {
                self.links.delete(process_id)?;
                Ok(StepResponse::Failed {
                    reason: reason.to_string(),
                })
            }
        }
    }
}

fn waiting(job_id: JobId, existing: bool) -> BackupRequested {
    BackupRequested {
        job_id,
        response: StepResponse::Waiting,
        existing,
    }
}
