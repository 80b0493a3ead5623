//! Deferred exclusive backup jobs.
//!
//! ## Components
//!
//! - `Job`: one requested course backup and its status
//! - `JobQueue`: durable queue with an atomic claim
//! - `ExclusivityLock`: one running backup per course
//! - `JobRunner`: claims due jobs and runs archive, retention and upload

pub mod lock;
pub mod runner;
pub mod store;
pub mod types;

pub use lock::{ExclusivityLock, InMemoryExclusivityLock, LockError, LockGuard, LockRecord};
pub use runner::{JobRunner, JobRunnerHandle, RunOutcome, RunnerConfig, RunnerDeps, RunnerError, RunnerStats};
pub use store::{InMemoryJobQueue, JobQueue, JobQueueError, JobStats};
pub use types::{FailureKind, InvalidTransition, Job, JobFailure, JobPayload, JobStatus};
