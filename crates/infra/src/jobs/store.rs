//! Job queue abstraction and the in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use lcbackup_core::{CourseId, JobId};

use super::lock::expiry;
use super::types::{InvalidTransition, Job, JobFailure, JobPayload, JobStatus};

/// Durable queue of backup jobs.
///
/// Owns every [`Job`]; all status changes go through it.
pub trait JobQueue: Send + Sync {
    /// Create a Pending job claimable from `not_before` on.
    fn enqueue(
        &self,
        resource_key: CourseId,
        payload: JobPayload,
        not_before: DateTime<Utc>,
    ) -> Result<JobId, JobQueueError>;

    /// Atomically move one due Pending job to Running, leased for `lease`.
    ///
    /// Oldest schedule first. A job is skipped while another job with the same
    /// resource key is Running. No two callers ever receive the same job.
    /// Running jobs whose lease ran out are failed in the same step, so an
    /// abandoned claim blocks its course for at most one lease.
    fn claim_due(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobQueueError>;

    /// Put a Running job back to Pending (lock contention).
    fn requeue(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<(), JobQueueError>;

    /// Running -> Succeeded. A second call is a no-op.
    fn mark_succeeded(&self, job_id: JobId) -> Result<(), JobQueueError>;

    /// Running -> Failed. A second call is a no-op and keeps the first reason.
    fn mark_failed(&self, job_id: JobId, reason: JobFailure) -> Result<(), JobQueueError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError>;

    /// Remove a job regardless of state. Returns whether it existed.
    fn delete(&self, job_id: JobId) -> Result<bool, JobQueueError>;

    /// Remove a job only while it is still Pending. Returns whether it was removed.
    fn cancel(&self, job_id: JobId) -> Result<bool, JobQueueError>;

    /// Remove terminal jobs last updated before `older_than`.
    fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, JobQueueError>;

    fn stats(&self) -> Result<JobStats, JobQueueError>;
}

/// Job queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobQueueError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// Contract violation by the caller: a bug, not a runtime condition.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn count(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed { .. } => self.failed += 1,
        }
    }
}

/// Shared enqueue validation for all queue implementations.
pub(crate) fn validate_enqueue(resource_key: CourseId, payload: &JobPayload) -> Result<(), JobQueueError> {
    resource_key
        .ensure_valid()
        .map_err(|e| JobQueueError::InvalidPayload(e.to_string()))?;
    payload
        .validate()
        .map_err(|e| JobQueueError::InvalidPayload(e.to_string()))
}

/// In-memory job queue for tests/dev.
///
/// A single write lock makes `claim_due` atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobQueueError> {
        self.jobs
            .read()
            .map_err(|_| JobQueueError::Storage("job table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobQueueError> {
        self.jobs
            .write()
            .map_err(|_| JobQueueError::Storage("job table lock poisoned".to_string()))
    }

    fn with_job<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, InvalidTransition>,
    ) -> Result<T, JobQueueError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobQueueError::NotFound(job_id))?;
        Ok(f(job)?)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(
        &self,
        resource_key: CourseId,
        payload: JobPayload,
        not_before: DateTime<Utc>,
    ) -> Result<JobId, JobQueueError> {
        validate_enqueue(resource_key, &payload)?;
        let job = Job::new(resource_key, payload, not_before);
        let id = job.id;
        self.write()?.insert(id, job);
        Ok(id)
    }

    fn claim_due(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobQueueError> {
        let mut jobs = self.write()?;

        for job in jobs.values_mut() {
            if job.expire(now)? {
                warn!(job_id = %job.id, course_id = %job.resource_key, "running job lease expired");
            }
        }

        let busy: HashSet<CourseId> = jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Running))
            .map(|j| j.resource_key)
            .collect();

        let next = jobs
            .values()
            .filter(|j| j.is_due(now) && !busy.contains(&j.resource_key))
            .min_by_key(|j| (j.scheduled_at, j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.begin(now, expiry(now, lease))?;
        Ok(Some(job.clone()))
    }

    fn requeue(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<(), JobQueueError> {
        self.with_job(job_id, |job| job.requeue(not_before, Utc::now()))
    }

    fn mark_succeeded(&self, job_id: JobId) -> Result<(), JobQueueError> {
        self.with_job(job_id, |job| job.succeed(Utc::now()).map(|_| ()))
    }

    fn mark_failed(&self, job_id: JobId, reason: JobFailure) -> Result<(), JobQueueError> {
        self.with_job(job_id, |job| job.fail(reason, Utc::now()).map(|_| ()))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        Ok(self.write()?.remove(&job_id).is_some())
    }

    fn cancel(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let mut jobs = self.write()?;
        if jobs.get(&job_id).is_some_and(|j| matches!(j.status, JobStatus::Pending)) {
            jobs.remove(&job_id);
            return Ok(true);
        }
        Ok(false)
    }

    fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, JobQueueError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < older_than));
        Ok(before - jobs.len())
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.count(&job.status);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use lcbackup_core::{ProcessId, StepInstanceId, StepSettings};

    use super::*;
    use crate::jobs::types::FailureKind;

    const LEASE: Duration = Duration::from_secs(600);

    fn payload(process: i64) -> JobPayload {
        JobPayload::new(ProcessId::new(process), StepInstanceId::new(3), StepSettings::default())
    }

    #[test]
    fn enqueue_and_claim() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(CourseId::new(42), payload(1), Utc::now()).unwrap();

        let claimed = queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);

        assert!(queue.claim_due(Utc::now(), LEASE).unwrap().is_none());
    }

    #[test]
    fn enqueue_rejects_invalid_payload() {
        let queue = InMemoryJobQueue::new();
        let err = queue.enqueue(CourseId::new(0), payload(1), Utc::now()).unwrap_err();
        assert!(matches!(err, JobQueueError::InvalidPayload(_)));

        let err = queue.enqueue(CourseId::new(5), payload(-1), Utc::now()).unwrap_err();
        assert!(matches!(err, JobQueueError::InvalidPayload(_)));
        assert_eq!(queue.stats().unwrap(), JobStats::default());
    }

    #[test]
    fn future_jobs_are_not_due() {
        let queue = InMemoryJobQueue::new();
        let later = Utc::now() + chrono::Duration::minutes(5);
        queue.enqueue(CourseId::new(1), payload(1), later).unwrap();

        assert!(queue.claim_due(Utc::now(), LEASE).unwrap().is_none());
        assert!(queue.claim_due(later, LEASE).unwrap().is_some());
    }

    #[test]
    fn oldest_schedule_is_claimed_first() {
        let queue = InMemoryJobQueue::new();
        let now = Utc::now();
        let second = queue
            .enqueue(CourseId::new(1), payload(1), now - chrono::Duration::seconds(10))
            .unwrap();
        let first = queue
            .enqueue(CourseId::new(2), payload(2), now - chrono::Duration::seconds(60))
            .unwrap();

        assert_eq!(queue.claim_due(now, LEASE).unwrap().unwrap().id, first);
        assert_eq!(queue.claim_due(now, LEASE).unwrap().unwrap().id, second);
    }

    #[test]
    fn same_course_is_not_claimed_while_running() {
        let queue = InMemoryJobQueue::new();
        let course = CourseId::new(42);
        let first = queue.enqueue(course, payload(1), Utc::now()).unwrap();
        let second = queue.enqueue(course, payload(2), Utc::now()).unwrap();
        let other = queue.enqueue(CourseId::new(7), payload(3), Utc::now()).unwrap();

        let a = queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();
        let b = queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();
        assert_eq!(a.id, first);
        assert_eq!(b.id, other);
        assert!(queue.claim_due(Utc::now(), LEASE).unwrap().is_none());

        queue.mark_succeeded(first).unwrap();
        assert_eq!(queue.claim_due(Utc::now(), LEASE).unwrap().unwrap().id, second);
    }

    #[test]
    fn terminal_transitions_are_idempotent() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(CourseId::new(42), payload(1), Utc::now()).unwrap();

        // Not running yet.
        assert!(matches!(
            queue.mark_succeeded(id),
            Err(JobQueueError::InvalidTransition(_))
        ));

        queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();
        queue.mark_succeeded(id).unwrap();
        queue.mark_succeeded(id).unwrap();
        assert_eq!(queue.get(id).unwrap().unwrap().status, JobStatus::Succeeded);

        let err = queue
            .mark_failed(id, JobFailure::new(FailureKind::Internal, "late"))
            .unwrap_err();
        assert!(matches!(err, JobQueueError::InvalidTransition(_)));
    }

    #[test]
    fn mark_failed_keeps_first_reason() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(CourseId::new(42), payload(1), Utc::now()).unwrap();
        queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();

        queue
            .mark_failed(id, JobFailure::new(FailureKind::TransferError, "first"))
            .unwrap();
        queue
            .mark_failed(id, JobFailure::new(FailureKind::Internal, "second"))
            .unwrap();

        let job = queue.get(id).unwrap().unwrap();
        assert_eq!(job.last_error.as_deref(), Some("transfer error: first"));
    }

    #[test]
    fn unknown_job_is_not_found() {
        let queue = InMemoryJobQueue::new();
        let id = JobId::new();
        assert_eq!(queue.mark_succeeded(id), Err(JobQueueError::NotFound(id)));
        assert!(queue.get(id).unwrap().is_none());
        assert!(!queue.delete(id).unwrap());
    }

    #[test]
    fn purge_only_removes_old_terminal_jobs() {
        let queue = InMemoryJobQueue::new();
        let done = queue.enqueue(CourseId::new(1), payload(1), Utc::now()).unwrap();
        let waiting = queue.enqueue(CourseId::new(2), payload(2), Utc::now()).unwrap();
        queue.claim_due(Utc::now(), LEASE).unwrap();
        queue.mark_succeeded(done).unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(queue.purge_finished(cutoff).unwrap(), 1);
        assert!(queue.get(done).unwrap().is_none());
        assert!(queue.get(waiting).unwrap().is_some());
    }

    #[test]
    fn expired_lease_frees_the_course() {
        let queue = InMemoryJobQueue::new();
        let course = CourseId::new(42);
        let abandoned = queue.enqueue(course, payload(1), Utc::now()).unwrap();
        let next = queue.enqueue(course, payload(2), Utc::now()).unwrap();

        let claimed_at = Utc::now();
        let job = queue.claim_due(claimed_at, Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(job.id, abandoned);
        assert!(job.lease_expires_at.is_some());
        assert!(queue.claim_due(claimed_at, LEASE).unwrap().is_none());

        let later = claimed_at + chrono::Duration::seconds(6);
        assert_eq!(queue.claim_due(later, LEASE).unwrap().unwrap().id, next);

        let JobStatus::Failed { reason } = queue.get(abandoned).unwrap().unwrap().status else {
            panic!("abandoned job should have failed");
        };
        assert_eq!(reason.kind, FailureKind::Internal);
        assert_eq!(reason.message, "lease expired");
    }

    #[test]
    fn cancel_only_removes_pending_jobs() {
        let queue = InMemoryJobQueue::new();
        let claimed = queue.enqueue(CourseId::new(1), payload(1), Utc::now()).unwrap();
        queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();
        let waiting = queue.enqueue(CourseId::new(2), payload(2), Utc::now() + chrono::Duration::minutes(1)).unwrap();

        assert!(!queue.cancel(claimed).unwrap());
        assert_eq!(queue.get(claimed).unwrap().unwrap().status, JobStatus::Running);
        assert!(queue.cancel(waiting).unwrap());
        assert!(queue.get(waiting).unwrap().is_none());
        assert!(!queue.cancel(JobId::new()).unwrap());
    }

    #[test]
    fn concurrent_claims_hand_out_a_job_once() {
        const CLAIMERS: usize = 16;
        let queue = InMemoryJobQueue::arc();
        queue.enqueue(CourseId::new(42), payload(1), Utc::now()).unwrap();

        let barrier = Arc::new(Barrier::new(CLAIMERS));
        let handles: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let queue = queue.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    queue.claim_due(Utc::now(), LEASE).unwrap()
                })
            })
            .collect();

        let claimed = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(claimed, 1);
    }

    #[test]
    fn stats_tracking() {
        let queue = InMemoryJobQueue::new();
        for i in 1..=5 {
            queue.enqueue(CourseId::new(i), payload(i), Utc::now()).unwrap();
        }
        assert_eq!(queue.stats().unwrap().pending, 5);

        let job = queue.claim_due(Utc::now(), LEASE).unwrap().unwrap();
        queue.claim_due(Utc::now(), LEASE).unwrap();
        queue.mark_succeeded(job.id).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.succeeded, 1);
    }
}
