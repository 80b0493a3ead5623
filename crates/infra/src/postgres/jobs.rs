use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use lcbackup_core::{CourseId, JobId};

use super::{describe, is_unique_violation, PgContext};
use crate::jobs::lock::expiry;
use crate::jobs::store::validate_enqueue;
use crate::jobs::{
    FailureKind, InvalidTransition, Job, JobFailure, JobPayload, JobQueue, JobQueueError, JobStats, JobStatus,
};

const JOB_COLUMNS: &str = "id, resource_key, payload, status, failure, scheduled_at, attempts, lease_expires_at, \
     last_error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    cx: PgContext,
}

fn storage(operation: &str, err: sqlx::Error) -> JobQueueError {
    JobQueueError::Storage(describe(operation, &err))
}

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let failure: Option<Json<JobFailure>> = row.try_get("failure")?;
    let status = match (status.as_str(), failure) {
        ("pending", _) => JobStatus::Pending,
        ("running", _) => JobStatus::Running,
        ("succeeded", _) => JobStatus::Succeeded,
        ("failed", Some(Json(reason))) => JobStatus::Failed { reason },
        (other, _) => {
            return Err(sqlx::Error::Decode(
                format!("invalid job status {other:?} or missing failure").into(),
            ));
        }
    };
    let attempts: i32 = row.try_get("attempts")?;
    let Json(payload): Json<JobPayload> = row.try_get("payload")?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id")?),
        resource_key: CourseId::new(row.try_get("resource_key")?),
        payload,
        status,
        scheduled_at: row.try_get("scheduled_at")?,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn failure_of(status: &JobStatus) -> Option<Json<&JobFailure>> {
    match status {
        JobStatus::Failed { reason } => Some(Json(reason)),
        _ => None,
    }
}

impl PostgresJobQueue {
    pub fn new(cx: PgContext) -> Self {
        Self { cx }
    }

    #[instrument(skip(self, payload), fields(course_id = %resource_key), err)]
    pub async fn enqueue_job(
        &self,
        resource_key: CourseId,
        payload: JobPayload,
        not_before: DateTime<Utc>,
    ) -> Result<JobId, JobQueueError> {
        validate_enqueue(resource_key, &payload)?;
        let job = Job::new(resource_key, payload, not_before);

        sqlx::query(
            r#"
            INSERT INTO lcbackup_jobs
                (id, resource_key, payload, status, failure, scheduled_at, attempts, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, 'pending', NULL, $4, 0, NULL, $5, $5)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.resource_key.get())
        .bind(Json(&job.payload))
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .execute(self.cx.pool())
        .await
        .map_err(|e| storage("enqueue", e))?;

        Ok(job.id)
    }

    /// Expired leases are failed first, in the claim's transaction, so the
    /// partial unique index never sees two running jobs for one course.
    /// Pending jobs of a course that already has a running job are skipped;
    /// the index settles the race between two claimers that pick different
    /// jobs of the same course.
    #[instrument(skip(self), err)]
    pub async fn claim_due_job(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobQueueError> {
        let mut tx = self.cx.pool().begin().await.map_err(|e| storage("claim_due", e))?;

        let reason = JobFailure::new(FailureKind::Internal, "lease expired");
        let expired = sqlx::query(
            r#"
            UPDATE lcbackup_jobs
            SET status = 'failed', failure = $2, last_error = $3, lease_expires_at = NULL, updated_at = $1
            WHERE status = 'running' AND lease_expires_at <= $1
            "#,
        )
        .bind(now)
        .bind(Json(&reason))
        .bind(reason.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| storage("claim_due", e))?
        .rows_affected();
        if expired > 0 {
            warn!(expired, "running job leases expired");
        }

        let sql = format!(
            r#"
            UPDATE lcbackup_jobs
            SET status = 'running', attempts = attempts + 1, lease_expires_at = $2, updated_at = $1
            WHERE id = (
                SELECT j.id FROM lcbackup_jobs j
                WHERE j.status = 'pending'
                  AND j.scheduled_at <= $1
                  AND NOT EXISTS (
                      SELECT 1 FROM lcbackup_jobs r
                      WHERE r.resource_key = j.resource_key AND r.status = 'running'
                  )
                ORDER BY j.scheduled_at, j.created_at, j.id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let claimed = match sqlx::query(&sql)
            .bind(now)
            .bind(expiry(now, lease))
            .fetch_optional(&mut *tx)
            .await
        {
            Ok(row) => row
                .as_ref()
                .map(job_from_row)
                .transpose()
                .map_err(|e| storage("claim_due", e))?,
            Err(e) if is_unique_violation(&e) => {
                debug!("claim lost to a concurrent claim for the same course");
                return Ok(None);
            }
            Err(e) => return Err(storage("claim_due", e)),
        };

        tx.commit().await.map_err(|e| storage("claim_due", e))?;
        Ok(claimed)
    }

    /// Load the job under a row lock, apply `change`, write it back.
    async fn transition(
        &self,
        operation: &str,
        job_id: JobId,
        change: impl FnOnce(&mut Job) -> Result<bool, InvalidTransition>,
    ) -> Result<(), JobQueueError> {
        let mut tx = self.cx.pool().begin().await.map_err(|e| storage(operation, e))?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM lcbackup_jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| storage(operation, e))?
            .ok_or(JobQueueError::NotFound(job_id))?;
        let mut job = job_from_row(&row).map_err(|e| storage(operation, e))?;

        if change(&mut job)? {
            sqlx::query(
                r#"
                UPDATE lcbackup_jobs
                SET status = $2, failure = $3, scheduled_at = $4, lease_expires_at = $5,
                    last_error = $6, updated_at = $7
                WHERE id = $1
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.status.name())
            .bind(failure_of(&job.status))
            .bind(job.scheduled_at)
            .bind(job.lease_expires_at)
            .bind(job.last_error.as_deref())
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage(operation, e))?;
        }

        tx.commit().await.map_err(|e| storage(operation, e))
    }

    #[instrument(skip(self), err)]
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM lcbackup_jobs WHERE id = $1");
        sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(self.cx.pool())
            .await
            .map_err(|e| storage("get", e))?
            .as_ref()
            .map(job_from_row)
            .transpose()
            .map_err(|e| storage("get", e))
    }

    #[instrument(skip(self), err)]
    pub async fn delete_job(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let result = sqlx::query("DELETE FROM lcbackup_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(self.cx.pool())
            .await
            .map_err(|e| storage("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        let result = sqlx::query("DELETE FROM lcbackup_jobs WHERE id = $1 AND status = 'pending'")
            .bind(job_id.as_uuid())
            .execute(self.cx.pool())
            .await
            .map_err(|e| storage("cancel", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    pub async fn purge_finished_jobs(&self, older_than: DateTime<Utc>) -> Result<usize, JobQueueError> {
        let result = sqlx::query(
            "DELETE FROM lcbackup_jobs WHERE status IN ('succeeded', 'failed') AND updated_at < $1",
        )
        .bind(older_than)
        .execute(self.cx.pool())
        .await
        .map_err(|e| storage("purge_finished", e))?;
        Ok(result.rows_affected() as usize)
    }

    #[instrument(skip(self), err)]
    pub async fn job_stats(&self) -> Result<JobStats, JobQueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM lcbackup_jobs GROUP BY status")
            .fetch_all(self.cx.pool())
            .await
            .map_err(|e| storage("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| storage("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| storage("stats", e))?;
            let total = total as usize;
            match status.as_str() {
                "pending" => stats.pending = total,
                "running" => stats.running = total,
                "succeeded" => stats.succeeded = total,
                "failed" => stats.failed = total,
                _ => {}
            }
        }
        Ok(stats)
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(
        &self,
        resource_key: CourseId,
        payload: JobPayload,
        not_before: DateTime<Utc>,
    ) -> Result<JobId, JobQueueError> {
        self.cx.block_on(self.enqueue_job(resource_key, payload, not_before))
    }

    fn claim_due(&self, now: DateTime<Utc>, lease: Duration) -> Result<Option<Job>, JobQueueError> {
        self.cx.block_on(self.claim_due_job(now, lease))
    }

    fn requeue(&self, job_id: JobId, not_before: DateTime<Utc>) -> Result<(), JobQueueError> {
        self.cx.block_on(self.transition("requeue", job_id, |job| {
            job.requeue(not_before, Utc::now()).map(|()| true)
        }))
    }

    fn mark_succeeded(&self, job_id: JobId) -> Result<(), JobQueueError> {
        self.cx
            .block_on(self.transition("mark_succeeded", job_id, |job| job.succeed(Utc::now())))
    }

    fn mark_failed(&self, job_id: JobId, reason: JobFailure) -> Result<(), JobQueueError> {
        self.cx
            .block_on(self.transition("mark_failed", job_id, |job| job.fail(reason, Utc::now())))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.cx.block_on(self.get_job(job_id))
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        self.cx.block_on(self.delete_job(job_id))
    }

    fn cancel(&self, job_id: JobId) -> Result<bool, JobQueueError> {
        self.cx.block_on(self.cancel_job(job_id))
    }

    fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<usize, JobQueueError> {
        self.cx.block_on(self.purge_finished_jobs(older_than))
    }

    fn stats(&self) -> Result<JobStats, JobQueueError> {
        self.cx.block_on(self.job_stats())
    }
}
