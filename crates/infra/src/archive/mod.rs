//! Archive engine boundary.
//!
//! The engine itself is external. An [`ArchiveService`] turns a course plus an
//! option set into an archive blob, and an archive blob back into a course.

mod command;
mod manifest;

pub use command::CommandArchiveService;
pub use manifest::ManifestArchiveService;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lcbackup_core::{BackupOptions, BlobId, Course, CourseId, Deadline};

use crate::blob::{Blob, BlobStoreError};

/// Immutable archive produced for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    /// Blob holding the archive content.
    pub id: BlobId,
    pub content_hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub source_course_id: CourseId,
    pub filename: String,
}

impl Archive {
    pub fn from_blob(blob: &Blob, source_course_id: CourseId) -> Self {
        Self {
            id: blob.id,
            content_hash: blob.metadata.content_hash.clone(),
            size_bytes: blob.metadata.size_bytes,
            created_at: blob.metadata.created_at,
            source_course_id,
            filename: blob.metadata.filename.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive engine failed: {0}")]
    Engine(String),
    #[error("archive engine exceeded its deadline")]
    Timeout,
    #[error("not a usable archive: {0}")]
    InvalidArchive(String),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error("archive io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub trait ArchiveService: Send + Sync {
    /// Back up `course` with `options` passed through verbatim.
    fn create_archive(
        &self,
        course: &Course,
        options: &BackupOptions,
        deadline: Deadline,
    ) -> Result<Archive, ArchiveError>;

    /// Restore an archive into a new course and return its id.
    fn restore_archive(&self, blob: &Blob, deadline: Deadline) -> Result<CourseId, ArchiveError>;
}
