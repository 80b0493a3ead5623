//! Job runner: claims due backup jobs and drives them to a terminal state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::{debug, error, info, warn};

use lcbackup_core::{Course, Deadline, JobId};

use super::lock::{ExclusivityLock, LockGuard};
use super::store::{JobQueue, JobQueueError};
use super::types::{FailureKind, Job, JobFailure};
use crate::archive::{Archive, ArchiveService};
use crate::blob::BlobStore;
use crate::catalog::BackupCatalog;
use crate::directory::CourseDirectory;
use crate::upload::{UploadError, UploadService};

/// Runner configuration, also the `[runner]` config section.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Thread name prefix and lock holder prefix.
    pub name: String,
    pub workers: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "poll_interval_ms")]
    pub poll_interval: Duration,
    /// Upper bound on one job's run; an expired lock can be taken over.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "lock_ttl_secs")]
    pub lock_ttl: Duration,
    /// Delay before a job that found its course locked is claimable again.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "contention_backoff_secs")]
    pub contention_backoff: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "archive_timeout_secs")]
    pub archive_timeout: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "upload_timeout_secs")]
    pub upload_timeout: Duration,
    /// Keep a catalog copy of every archive.
    pub retain_local_copy: bool,
    /// Finished jobs older than this are purged from the queue.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "retain_finished_secs")]
    pub retain_finished: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "purge_interval_secs")]
    pub purge_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: "backup-runner".to_string(),
            workers: 2,
            poll_interval: Duration::from_millis(500),
            lock_ttl: Duration::from_secs(600),
            contention_backoff: Duration::from_secs(30),
            archive_timeout: Duration::from_secs(300),
            upload_timeout: Duration::from_secs(240),
            retain_local_copy: true,
            retain_finished: Duration::from_secs(7 * 24 * 3600),
            purge_interval: Duration::from_secs(3600),
        }
    }
}

impl RunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Collaborators shared by every runner of a pool.
#[derive(Clone)]
pub struct RunnerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub lock: Arc<dyn ExclusivityLock>,
    pub courses: Arc<dyn CourseDirectory>,
    pub archives: Arc<dyn ArchiveService>,
    pub blobs: Arc<dyn BlobStore>,
    pub catalog: Arc<BackupCatalog>,
    /// `None` when uploads are not supported at all.
    pub upload: Option<Arc<UploadService>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was due.
    Idle,
    Succeeded(JobId),
    Failed(JobId, JobFailure),
    /// The course was locked; the job is Pending again.
    Requeued(JobId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error("failed to spawn runner thread: {0}")]
    Spawn(String),
}

/// Runtime statistics of a runner pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_requeued: u64,
    pub queue_errors: u64,
    pub jobs_purged: u64,
    pub uptime_secs: u64,
}

impl RunnerStats {
    fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Idle => return,
            RunOutcome::Succeeded(_) => self.jobs_succeeded += 1,
            RunOutcome::Failed(..) => self.jobs_failed += 1,
            RunOutcome::Requeued(_) => self.jobs_requeued += 1,
        }
        self.jobs_processed += 1;
    }
}

/// A single backup runner.
pub struct JobRunner {
    id: String,
    deps: RunnerDeps,
    config: RunnerConfig,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn upload_failure(err: UploadError) -> JobFailure {
    match err {
        UploadError::NotConfigured(msg) => JobFailure::new(FailureKind::UploadNotConfigured, msg),
        UploadError::RemoteUnreachable(msg) => JobFailure::new(FailureKind::RemoteUnreachable, msg),
        UploadError::TransferError(msg) => JobFailure::new(FailureKind::TransferError, msg),
        other => JobFailure::new(FailureKind::Internal, other.to_string()),
    }
}

fn internal(err: impl std::fmt::Display) -> JobFailure {
    JobFailure::new(FailureKind::Internal, err.to_string())
}

impl JobRunner {
    /// `id` is the lock holder id; it must be unique per runner.
    pub fn new(id: impl Into<String>, deps: RunnerDeps, config: RunnerConfig) -> Self {
        Self {
            id: id.into(),
            deps,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process at most one due job.
    ///
    /// Job failures are recorded on the job and reported as
    /// [`RunOutcome::Failed`]; only queue errors are returned as `Err`.
    pub fn run_once(&self) -> Result<RunOutcome, RunnerError> {
        let Some(job) = self.deps.queue.claim_due(Utc::now(), self.config.lock_ttl)? else {
            return Ok(RunOutcome::Idle);
        };
        debug!(
            runner = %self.id,
            job_id = %job.id,
            course_id = %job.resource_key,
            attempt = job.attempts,
            "claimed job"
        );

        let course = match self.deps.courses.find(job.resource_key) {
            Ok(Some(course)) => course,
            Ok(None) => {
                let reason = JobFailure::new(
                    FailureKind::CourseNotFound,
                    format!("course {} does not exist", job.resource_key),
                );
                return self.fail(&job, reason);
            }
            Err(e) => return self.fail(&job, internal(e)),
        };

        let guard = match LockGuard::acquire(
            self.deps.lock.as_ref(),
            job.resource_key,
            &self.id,
            self.config.lock_ttl,
        ) {
            Ok(Some(guard)) => guard,
            Ok(None) => return self.requeue(&job, "course locked by another holder"),
            Err(e) => {
                warn!(runner = %self.id, job_id = %job.id, error = %e, "lock unavailable");
                return self.requeue(&job, "lock storage unavailable");
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(&job, &course)))
            .unwrap_or_else(|payload| {
                error!(runner = %self.id, job_id = %job.id, "backup job panicked");
                Err(internal(format!("panicked: {}", panic_message(payload.as_ref()))))
            });

        // Released before the terminal mark: while the job is still Running no
        // other job for this course can be claimed.
        drop(guard);

        match result {
            Ok(()) => {
                self.deps.queue.mark_succeeded(job.id)?;
                info!(runner = %self.id, job_id = %job.id, course_id = %job.resource_key, "backup job succeeded");
                Ok(RunOutcome::Succeeded(job.id))
            }
            Err(reason) => self.fail(&job, reason),
        }
    }

    fn fail(&self, job: &Job, reason: JobFailure) -> Result<RunOutcome, RunnerError> {
        warn!(
            runner = %self.id,
            job_id = %job.id,
            course_id = %job.resource_key,
            process_id = %job.payload.process_id,
            kind = reason.kind.as_str(),
            reason = %reason.message,
            "backup job failed"
        );
        self.deps.queue.mark_failed(job.id, reason.clone())?;
        Ok(RunOutcome::Failed(job.id, reason))
    }

    fn requeue(&self, job: &Job, why: &str) -> Result<RunOutcome, RunnerError> {
        let not_before = Utc::now()
            + chrono::Duration::from_std(self.config.contention_backoff).unwrap_or_default();
        debug!(runner = %self.id, job_id = %job.id, course_id = %job.resource_key, why, "requeueing job");
        self.deps.queue.requeue(job.id, not_before)?;
        Ok(RunOutcome::Requeued(job.id))
    }

    /// Archive, retain and upload, with the course lock held.
    fn execute(&self, job: &Job, course: &Course) -> Result<(), JobFailure> {
        let settings = &job.payload.settings;
        if job.payload.wants_upload() && !self.deps.upload.as_ref().is_some_and(|u| u.accepts(settings)) {
            return Err(JobFailure::new(
                FailureKind::UploadNotConfigured,
                "upload requested but no remote store applies to this step instance",
            ));
        }

        let archive = self
            .deps
            .archives
            .create_archive(
                course,
                &settings.options,
                Deadline::after(self.config.archive_timeout),
            )
            .map_err(|e| JobFailure::new(FailureKind::ArchiveCreationFailed, e.to_string()))?;
        debug!(job_id = %job.id, blob_id = %archive.id, size = archive.size_bytes, "archive created");

        let result = self.deliver(job, course, &archive);
        self.discard(job, &archive);
        result
    }

    fn deliver(&self, job: &Job, course: &Course, archive: &Archive) -> Result<(), JobFailure> {
        let wants_upload = job.payload.wants_upload();
        if !self.config.retain_local_copy && !wants_upload {
            return Ok(());
        }

        let content = self
            .deps
            .blobs
            .get(archive.id)
            .map_err(internal)?
            .ok_or_else(|| {
                JobFailure::new(FailureKind::ArchiveCreationFailed, "archive vanished from blob store")
            })?
            .content;

        if self.config.retain_local_copy {
            self.deps
                .catalog
                .retain(course, archive, content.clone())
                .map_err(internal)?;
        }

        if let Some(upload) = self.deps.upload.as_ref().filter(|_| wants_upload) {
            upload
                .upload(job, archive, content, Deadline::after(self.config.upload_timeout))
                .map_err(upload_failure)?;
        }
        Ok(())
    }

    fn discard(&self, job: &Job, archive: &Archive) {
        if let Err(e) = self.deps.blobs.delete(archive.id) {
            warn!(job_id = %job.id, blob_id = %archive.id, error = %e, "failed to delete archive");
        }
    }

    /// Spawn `config.workers` runner threads plus one purge thread.
    pub fn spawn_pool(deps: RunnerDeps, config: RunnerConfig) -> Result<JobRunnerHandle, RunnerError> {
        let stats = Arc::new(Mutex::new(RunnerStats::default()));
        let mut handle = JobRunnerHandle {
            workers: Vec::with_capacity(config.workers),
            janitor: None,
            stats: stats.clone(),
            started: Instant::now(),
        };

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let queue = deps.queue.clone();
        let purge_config = config.clone();
        let purge_stats = stats.clone();
        let join = thread::Builder::new()
            .name(format!("{}-purge", config.name))
            .spawn(move || purge_loop(queue, purge_config, shutdown_rx, purge_stats))
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;
        handle.janitor = Some(Worker {
            shutdown: shutdown_tx,
            join: Some(join),
        });

        for i in 0..config.workers.max(1) {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let runner = JobRunner::new(
                format!("{}-{}-{}", config.name, i, uuid::Uuid::now_v7()),
                deps.clone(),
                config.clone(),
            );
            let stats = stats.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || runner_loop(runner, shutdown_rx, stats))
                .map_err(|e| RunnerError::Spawn(e.to_string()))?;
            handle.workers.push(Worker {
                shutdown: shutdown_tx,
                join: Some(join),
            });
        }
        Ok(handle)
    }
}

fn runner_loop(runner: JobRunner, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<RunnerStats>>) {
    info!(runner = %runner.id, "job runner started");

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let wait = match runner.run_once() {
            Ok(outcome) => {
                let idle = outcome == RunOutcome::Idle;
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                }
                idle
            }
            Err(e) => {
                error!(runner = %runner.id, error = %e, "job runner queue error");
                if let Ok(mut s) = stats.lock() {
                    s.queue_errors += 1;
                }
                true
            }
        };

        if wait {
            match shutdown_rx.recv_timeout(runner.config.poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    info!(runner = %runner.id, "job runner stopped");
}

/// Remove finished jobs older than `retain`. Returns how many went.
fn purge_finished(queue: &dyn JobQueue, retain: Duration) -> Result<usize, JobQueueError> {
    let now = Utc::now();
    let cutoff = chrono::Duration::from_std(retain)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    queue.purge_finished(cutoff)
}

fn purge_loop(
    queue: Arc<dyn JobQueue>,
    config: RunnerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<RunnerStats>>,
) {
    loop {
        match purge_finished(queue.as_ref(), config.retain_finished) {
            Ok(0) => {}
            Ok(purged) => {
                info!(purged, "purged finished jobs");
                if let Ok(mut s) = stats.lock() {
                    s.jobs_purged += purged as u64;
                }
            }
            Err(e) => {
                error!(error = %e, "failed to purge finished jobs");
                if let Ok(mut s) = stats.lock() {
                    s.queue_errors += 1;
                }
            }
        }

        match shutdown_rx.recv_timeout(config.purge_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

struct Worker {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

/// Handle to a running pool.
pub struct JobRunnerHandle {
    workers: Vec<Worker>,
    janitor: Option<Worker>,
    stats: Arc<Mutex<RunnerStats>>,
    started: Instant,
}

impl JobRunnerHandle {
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop every runner after its current job and wait for it.
    pub fn shutdown(mut self) {
        for worker in self.workers.iter().chain(self.janitor.as_ref()) {
            let _ = worker.shutdown.send(());
        }
        for worker in self.workers.iter_mut().chain(self.janitor.as_mut()) {
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
    }

    pub fn stats(&self) -> RunnerStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}
