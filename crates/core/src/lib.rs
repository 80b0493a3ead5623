//! `lcbackup-core`: domain building blocks for the course backup step.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the typed step settings, and the course/archive vocabulary
//! shared by the job system and its adapters.

pub mod course;
pub mod deadline;
pub mod error;
pub mod id;
pub mod options;
pub mod settings;

pub use course::{Course, default_archive_filename};
pub use deadline::Deadline;
pub use error::{DomainError, DomainResult};
pub use id::{BlobId, CatalogEntryId, CourseId, JobId, ProcessId, StepInstanceId};
pub use options::{BackupOption, BackupOptions};
pub use settings::{S3Credentials, S3Settings, StepSettings};
