//! Shared test doubles and an all-in-memory wiring of the backup step.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;

use lcbackup_core::{
    default_archive_filename, BackupOptions, Course, CourseId, Deadline, JobId, ProcessId, StepInstanceId,
    StepSettings,
};

use crate::archive::{Archive, ArchiveError, ArchiveService};
use crate::blob::{Blob, BlobStore, InMemoryBlobStore, ARCHIVE_COMPONENT};
use crate::catalog::{BackupCatalog, InMemoryCatalogStore};
use crate::directory::InMemoryCourseDirectory;
use crate::jobs::{InMemoryExclusivityLock, InMemoryJobQueue, JobPayload, JobQueue, JobRunner, RunnerConfig, RunnerDeps};
use crate::process::{InMemoryProcessLinkStore, ProcessStateBridge};
use crate::upload::{InMemoryRemoteStore, InMemoryRemoteStoreFactory, InMemoryUploadRecordStore, UploadService};

pub const COURSE: CourseId = CourseId::new(42);
pub const OTHER_COURSE: CourseId = CourseId::new(7);

#[derive(Debug, Clone)]
pub enum ArchiveMode {
    Succeed,
    Fail(String),
    Panic,
}

/// Archive engine double that counts calls and tracks per-course overlap.
pub struct ScriptedArchiveService {
    blobs: Arc<InMemoryBlobStore>,
    mode: Mutex<ArchiveMode>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    active: Mutex<HashMap<CourseId, (usize, usize)>>,
}

impl ScriptedArchiveService {
    pub fn new(blobs: Arc<InMemoryBlobStore>) -> Self {
        Self {
            blobs,
            mode: Mutex::new(ArchiveMode::Succeed),
            delay: Mutex::new(Duration::from_millis(5)),
            calls: AtomicUsize::new(0),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: ArchiveMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping archive runs seen for `course`.
    pub fn max_active_for(&self, course: CourseId) -> usize {
        self.active.lock().unwrap().get(&course).map(|(_, max)| *max).unwrap_or(0)
    }

    fn enter(&self, course: CourseId) {
        let mut active = self.active.lock().unwrap();
        let entry = active.entry(course).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
    }

    fn leave(&self, course: CourseId) {
        if let Some(entry) = self.active.lock().unwrap().get_mut(&course) {
            entry.0 -= 1;
        }
    }
}

impl ArchiveService for ScriptedArchiveService {
    fn create_archive(
        &self,
        course: &Course,
        options: &BackupOptions,
        _deadline: Deadline,
    ) -> Result<Archive, ArchiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.enter(course.id);
        thread::sleep(*self.delay.lock().unwrap());
        self.leave(course.id);

        let mode = self.mode.lock().unwrap().clone();
        match mode {
            ArchiveMode::Succeed => {
                let filename = default_archive_filename(course, options, Utc::now());
                let content = Bytes::from(format!("archive of course {}", course.id));
                let blob = self.blobs.save(ARCHIVE_COMPONENT, &filename, content)?;
                Ok(Archive::from_blob(&blob, course.id))
            }
            ArchiveMode::Fail(msg) => Err(ArchiveError::Engine(msg)),
            ArchiveMode::Panic => panic!("archive engine blew up"),
        }
    }

    fn restore_archive(&self, _blob: &Blob, _deadline: Deadline) -> Result<CourseId, ArchiveError> {
        Ok(CourseId::new(1000))
    }
}

/// Every collaborator of the backup step, in memory.
pub struct Harness {
    pub queue: Arc<InMemoryJobQueue>,
    pub lock: Arc<InMemoryExclusivityLock>,
    pub courses: Arc<InMemoryCourseDirectory>,
    pub blobs: Arc<InMemoryBlobStore>,
    pub archives: Arc<ScriptedArchiveService>,
    pub catalog: Arc<BackupCatalog>,
    /// Default remote.
    pub remote: Arc<InMemoryRemoteStore>,
    /// Remotes named by step instances.
    pub buckets: Arc<InMemoryRemoteStoreFactory>,
    pub records: Arc<InMemoryUploadRecordStore>,
    pub upload: Arc<UploadService>,
    pub links: Arc<InMemoryProcessLinkStore>,
}

impl Harness {
    pub fn new() -> Self {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let archives = Arc::new(ScriptedArchiveService::new(blobs.clone()));
        let courses = Arc::new(InMemoryCourseDirectory::with_courses([
            Course::new(COURSE, "BIO101", "Introductory Biology"),
            Course::new(OTHER_COURSE, "CHEM", "General Chemistry"),
        ]));
        let catalog = Arc::new(BackupCatalog::new(
            Arc::new(InMemoryCatalogStore::new()),
            blobs.clone(),
            archives.clone(),
            Duration::from_secs(5),
        ));
        let remote = Arc::new(InMemoryRemoteStore::new("course-backups"));
        let records = Arc::new(InMemoryUploadRecordStore::new());
        let buckets = Arc::new(InMemoryRemoteStoreFactory::new());
        let upload = Arc::new(
            UploadService::new(remote.clone(), records.clone(), "lifecycle/").with_factory(buckets.clone()),
        );

        Self {
            queue: InMemoryJobQueue::arc(),
            lock: Arc::new(InMemoryExclusivityLock::new()),
            courses,
            blobs,
            archives,
            catalog,
            remote,
            buckets,
            records,
            upload,
            links: Arc::new(InMemoryProcessLinkStore::new()),
        }
    }

    pub fn config() -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(10),
            archive_timeout: Duration::from_secs(5),
            upload_timeout: Duration::from_secs(5),
            ..RunnerConfig::default()
        }
        .with_name("test-runner")
    }

    pub fn deps(&self, with_upload: bool) -> RunnerDeps {
        RunnerDeps {
            queue: self.queue.clone(),
            lock: self.lock.clone(),
            courses: self.courses.clone(),
            archives: self.archives.clone(),
            blobs: self.blobs.clone(),
            catalog: self.catalog.clone(),
            upload: with_upload.then(|| self.upload.clone()),
        }
    }

    pub fn runner(&self, id: &str, config: RunnerConfig, with_upload: bool) -> JobRunner {
        JobRunner::new(id, self.deps(with_upload), config)
    }

    pub fn bridge(&self, with_upload: bool) -> ProcessStateBridge {
        ProcessStateBridge::new(self.queue.clone(), self.links.clone(), with_upload.then(|| self.upload.clone()))
    }

    pub fn payload(process: i64, upload: bool) -> JobPayload {
        JobPayload::new(
            ProcessId::new(process),
            StepInstanceId::new(3),
            StepSettings::new(BackupOptions::default(), upload),
        )
    }

    /// Queue a job for `course`, due now.
    pub fn enqueue(&self, course: CourseId, upload: bool) -> JobId {
        self.queue
            .enqueue(course, Self::payload(course.get() + 100, upload), Utc::now())
            .unwrap()
    }
}
