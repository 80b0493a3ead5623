//! Request/response bodies.

use serde::{Deserialize, Serialize};

use lcbackup_core::{BackupOptions, CourseId, S3Settings, StepInstanceId, StepSettings};
use lcbackup_infra::catalog::{CatalogFilter, Page};
use lcbackup_infra::jobs::{Job, JobStats, RunnerStats};
use lcbackup_infra::upload::UploadRecord;

/// Body of `POST /processes/{process_id}/backup`.
#[derive(Debug, Clone, Deserialize)]
pub struct BackupRequest {
    pub course_id: CourseId,
    pub instance_id: StepInstanceId,
    #[serde(default)]
    pub options: BackupOptions,
    #[serde(default)]
    pub upload: bool,
    /// The step instance's own remote; the deployment default when absent.
    #[serde(default)]
    pub remote: Option<S3Settings>,
}

impl BackupRequest {
    pub fn settings(&self) -> StepSettings {
        let settings = StepSettings::new(self.options.clone(), self.upload);
        match &self.remote {
            Some(remote) => settings.with_remote(remote.clone()),
            None => settings,
        }
    }
}

/// A job as shown over HTTP: remote credentials are redacted.
pub fn job_view(mut job: Job) -> Job {
    job.payload.settings = job.payload.settings.redacted();
    job
}

/// Body of `GET /courses/{course_id}/uploads`.
#[derive(Debug, Clone, Serialize)]
pub struct UploadsResponse {
    pub course_id: CourseId,
    pub items: Vec<UploadRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatsResponse {
    pub queue: JobStats,
    /// `None` when no runner pool is running in this process.
    pub runners: Option<RunnerStats>,
}

/// Query of `GET /backups`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListBackupsQuery {
    pub shortname: Option<String>,
    pub fullname: Option<String>,
    pub course_id: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListBackupsQuery {
    pub fn filter(&self) -> CatalogFilter {
        CatalogFilter {
            shortname: self.shortname.clone(),
            fullname: self.fullname.clone(),
            course_id: self.course_id.map(CourseId::new),
        }
    }

    pub fn page(&self) -> Page {
        let default = Page::default();
        Page::new(self.limit.unwrap_or(default.limit), self.offset.unwrap_or(default.offset))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResponse {
    pub course_id: CourseId,
}
