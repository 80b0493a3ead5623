//! Core job types and the job state machine.
//!
//! ```text
//! Pending --claim--> Running --success--> Succeeded
//!                    Running --failure--> Failed
//!                    Running --lock contended--> Pending
//!                    Running --lease expired--> Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lcbackup_core::{CourseId, DomainError, JobId, ProcessId, StepInstanceId, StepSettings};

/// What a backup job was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Workflow process that requested the backup.
    pub process_id: ProcessId,
    /// Step instance whose settings apply.
    pub instance_id: StepInstanceId,
    /// Option set, upload flag and remote, validated at enqueue time.
    #[serde(default)]
    pub settings: StepSettings,
}

impl JobPayload {
    pub fn new(process_id: ProcessId, instance_id: StepInstanceId, settings: StepSettings) -> Self {
        Self {
            process_id,
            instance_id,
            settings,
        }
    }

    /// Reject payloads the runner could not act on.
    pub fn validate(&self) -> Result<(), DomainError> {
        self.process_id.ensure_valid()?;
        self.instance_id.ensure_valid()?;
        self.settings.validate()
    }

    pub fn wants_upload(&self) -> bool {
        self.settings.upload
    }
}

/// Category of a terminal job failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CourseNotFound,
    ArchiveCreationFailed,
    RemoteUnreachable,
    TransferError,
    /// Upload requested, but this deployment has no remote store.
    UploadNotConfigured,
    /// Anything else the runner had to absorb (storage errors, panics).
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CourseNotFound => "course not found",
            FailureKind::ArchiveCreationFailed => "archive creation failed",
            FailureKind::RemoteUnreachable => "remote store unreachable",
            FailureKind::TransferError => "transfer error",
            FailureKind::UploadNotConfigured => "upload not configured",
            FailureKind::Internal => "internal error",
        }
    }
}

/// Structured reason stored on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for its scheduled time.
    Pending,
    /// Claimed by a runner.
    Running,
    Succeeded,
    Failed { reason: JobFailure },
}

impl JobStatus {
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed { .. })
    }
}

/// A state change the job's current status does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {job_id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub job_id: JobId,
    pub from: &'static str,
    pub to: &'static str,
}

/// A deferred backup job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Course being backed up; the exclusivity lock scope.
    pub resource_key: CourseId,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Not claimable before this instant.
    pub scheduled_at: DateTime<Utc>,
    /// Number of times the job was claimed.
    pub attempts: u32,
    /// Set while Running; past it the claim is considered abandoned.
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(resource_key: CourseId, payload: JobPayload, not_before: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            resource_key,
            payload,
            status: JobStatus::Pending,
            scheduled_at: not_before,
            attempts: 0,
            lease_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending) && self.scheduled_at <= now
    }

    fn rejected(&self, to: &'static str) -> InvalidTransition {
        InvalidTransition {
            job_id: self.id,
            from: self.status.name(),
            to,
        }
    }

    /// Whether a Running job outlived its lease.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Running) && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Pending -> Running, leased until `lease_until`.
    pub fn begin(&mut self, now: DateTime<Utc>, lease_until: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !matches!(self.status, JobStatus::Pending) {
            return Err(self.rejected("running"));
        }
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.lease_expires_at = Some(lease_until);
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Failed for a claim whose runner never reported back.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        if !self.lease_expired(now) {
            return Ok(false);
        }
        self.fail(JobFailure::new(FailureKind::Internal, "lease expired"), now)
    }

    /// Running -> Pending, scheduled again at `not_before`.
    pub fn requeue(&mut self, not_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !matches!(self.status, JobStatus::Running) {
            return Err(self.rejected("pending"));
        }
        self.status = JobStatus::Pending;
        self.scheduled_at = not_before;
        self.lease_expires_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Running -> Succeeded. Returns `false` when already succeeded.
    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        match self.status {
            JobStatus::Running => {
                self.status = JobStatus::Succeeded;
                self.lease_expires_at = None;
                self.updated_at = now;
                Ok(true)
            }
            JobStatus::Succeeded => Ok(false),
            _ => Err(self.rejected("succeeded")),
        }
    }

    /// Running -> Failed. Returns `false` when already failed.
    pub fn fail(&mut self, reason: JobFailure, now: DateTime<Utc>) -> Result<bool, InvalidTransition> {
        match self.status {
            JobStatus::Running => {
                self.last_error = Some(reason.to_string());
                self.status = JobStatus::Failed { reason };
                self.lease_expires_at = None;
                self.updated_at = now;
                Ok(true)
            }
            JobStatus::Failed { .. } => Ok(false),
            _ => Err(self.rejected("failed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        let payload = JobPayload::new(ProcessId::new(1), StepInstanceId::new(2), StepSettings::default());
        Job::new(CourseId::new(42), payload, Utc::now())
    }

    fn lease() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(10)
    }

    #[test]
    fn job_lifecycle() {
        let mut job = job();
        assert!(job.is_due(Utc::now()));
        assert_eq!(job.attempts, 0);

        job.begin(Utc::now(), lease()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert!(!job.is_due(Utc::now()));

        assert!(job.succeed(Utc::now()).unwrap());
        assert!(!job.succeed(Utc::now()).unwrap());
        assert!(job.status.is_terminal());
    }

    #[test]
    fn transitions_never_go_backward() {
        let mut job = job();
        assert!(job.succeed(Utc::now()).is_err());

        job.begin(Utc::now(), lease()).unwrap();
        job.fail(JobFailure::new(FailureKind::TransferError, "reset"), Utc::now())
            .unwrap();

        let err = job.succeed(Utc::now()).unwrap_err();
        assert_eq!(err.from, "failed");
        assert_eq!(err.to, "succeeded");
        assert!(job.begin(Utc::now(), lease()).is_err());
        assert!(job.requeue(Utc::now(), Utc::now()).is_err());
        assert_eq!(job.last_error.as_deref(), Some("transfer error: reset"));
    }

    #[test]
    fn requeue_keeps_attempt_count() {
        let mut job = job();
        job.begin(Utc::now(), lease()).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(30);
        job.requeue(later, Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(!job.is_due(Utc::now()));
        assert!(job.is_due(later));
    }

    #[test]
    fn expired_lease_fails_the_job() {
        let mut job = job();
        let claimed = Utc::now();
        job.begin(claimed, claimed + chrono::Duration::seconds(5)).unwrap();

        assert!(!job.expire(claimed).unwrap());
        assert_eq!(job.status, JobStatus::Running);

        let later = claimed + chrono::Duration::seconds(5);
        assert!(job.lease_expired(later));
        assert!(job.expire(later).unwrap());
        assert_eq!(job.last_error.as_deref(), Some("internal error: lease expired"));
        assert_eq!(job.lease_expires_at, None);
        assert!(!job.expire(later).unwrap());
    }

    #[test]
    fn payload_rejects_non_positive_ids() {
        let payload = JobPayload::new(ProcessId::new(0), StepInstanceId::new(2), StepSettings::default());
        assert!(payload.validate().is_err());
    }

    #[test]
    fn failure_reason_mentions_kind() {
        let reason = JobFailure::new(FailureKind::RemoteUnreachable, "dns error");
        assert_eq!(reason.to_string(), "remote store unreachable: dns error");
    }

    mod proptest_tests {
        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone, Copy)]
        enum Step {
            Begin,
            Requeue,
            Succeed,
            Fail,
        }

        fn step() -> impl Strategy<Value = Step> {
            prop_oneof![
                Just(Step::Begin),
                Just(Step::Requeue),
                Just(Step::Succeed),
                Just(Step::Fail),
            ]
        }

        proptest! {
            #[test]
            fn terminal_status_is_final(steps in prop::collection::vec(step(), 0..24)) {
                let mut job = job();
                let mut terminal: Option<JobStatus> = None;
                let mut begun = 0u32;

                for step in steps {
                    let now = Utc::now();
                    let before = job.status.clone();
                    let applied = match step {
                        Step::Begin => job.begin(now, now).is_ok(),
                        Step::Requeue => job.requeue(now, now).is_ok(),
                        Step::Succeed => job.succeed(now).is_ok(),
                        Step::Fail => job
                            .fail(JobFailure::new(FailureKind::Internal, "boom"), now)
                            .is_ok(),
                    };
                    if !applied {
                        prop_assert_eq!(&job.status, &before);
                    }
                    if matches!(step, Step::Begin) && applied {
                        begun += 1;
                    }
                    if let Some(done) = &terminal {
                        prop_assert_eq!(&job.status, done);
                    } else if job.status.is_terminal() {
                        terminal = Some(job.status.clone());
                    }
                }
                prop_assert_eq!(job.attempts, begun);
            }
        }
    }
}
