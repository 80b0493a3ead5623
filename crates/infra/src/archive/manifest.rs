use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lcbackup_core::{default_archive_filename, BackupOptions, Course, CourseId, Deadline};

use super::{Archive, ArchiveError, ArchiveService};
use crate::blob::{Blob, BlobStore, ARCHIVE_COMPONENT};
use crate::directory::InMemoryCourseDirectory;

/// Stand-in engine for development: an archive is a JSON manifest of the
/// course and options, and restoring one adds a copy of the course to an
/// in-memory directory.
pub struct ManifestArchiveService {
    blobs: Arc<dyn BlobStore>,
    courses: Arc<InMemoryCourseDirectory>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    course: Course,
    options: BackupOptions,
    created_at: DateTime<Utc>,
}

impl ManifestArchiveService {
    pub fn new(blobs: Arc<dyn BlobStore>, courses: Arc<InMemoryCourseDirectory>) -> Self {
        Self { blobs, courses }
    }
}

impl ArchiveService for ManifestArchiveService {
    fn create_archive(
        &self,
        course: &Course,
        options: &BackupOptions,
        deadline: Deadline,
    ) -> Result<Archive, ArchiveError> {
        if deadline.is_expired() {
            return Err(ArchiveError::Timeout);
        }
        let manifest = Manifest {
            course: course.clone(),
            options: options.clone(),
            created_at: Utc::now(),
        };
        let content = serde_json::to_vec(&manifest).map_err(|e| ArchiveError::Engine(e.to_string()))?;
        let filename = default_archive_filename(course, options, manifest.created_at);
        let blob = self.blobs.save(ARCHIVE_COMPONENT, &filename, Bytes::from(content))?;
        Ok(Archive::from_blob(&blob, course.id))
    }

    fn restore_archive(&self, blob: &Blob, deadline: Deadline) -> Result<CourseId, ArchiveError> {
        if deadline.is_expired() {
            return Err(ArchiveError::Timeout);
        }
        let manifest: Manifest = serde_json::from_slice(&blob.content)
            .map_err(|e| ArchiveError::InvalidArchive(e.to_string()))?;
        let id = self.courses.next_id();
        self.courses.insert(Course::new(
            id,
            format!("{}_{}", manifest.course.shortname, id),
            manifest.course.fullname,
        ));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::directory::CourseDirectory;

    #[test]
    fn restore_creates_a_copy_of_the_course() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let courses = Arc::new(InMemoryCourseDirectory::with_courses([Course::new(
            CourseId::new(5),
            "HIST",
            "History",
        )]));
        let engine = ManifestArchiveService::new(blobs.clone(), courses.clone());
        let deadline = Deadline::after(Duration::from_secs(5));

        let course = courses.find(CourseId::new(5)).unwrap().unwrap();
        let archive = engine
            .create_archive(&course, &BackupOptions::default(), deadline)
            .unwrap();
        let blob = blobs.get(archive.id).unwrap().unwrap();

        let restored = engine.restore_archive(&blob, deadline).unwrap();
        assert_eq!(restored, CourseId::new(6));
        let copy = courses.find(restored).unwrap().unwrap();
        assert_eq!(copy.fullname, "History");
        assert_eq!(copy.shortname, "HIST_6");
    }

    #[test]
    fn garbage_is_not_restorable() {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let engine = ManifestArchiveService::new(blobs.clone(), Arc::new(InMemoryCourseDirectory::new()));
        let blob = blobs.save("x", "x", Bytes::from_static(b"not json")).unwrap();
        assert!(matches!(
            engine.restore_archive(&blob, Deadline::after(Duration::from_secs(5))),
            Err(ArchiveError::InvalidArchive(_))
        ));
    }
}
