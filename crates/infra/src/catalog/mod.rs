//! Catalog of retained backup copies.
//!
//! Every finished job may leave a copy of its archive in the blob store under
//! [`CATALOG_COMPONENT`]. The catalog keeps one entry per copy so backups can
//! be listed, downloaded, restored and removed later.

mod store;

pub use store::{CatalogStore, CatalogStoreError, InMemoryCatalogStore};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lcbackup_core::{BlobId, CatalogEntryId, Course, CourseId, Deadline};

use crate::archive::{Archive, ArchiveError, ArchiveService};
use crate::blob::{BlobStore, BlobStoreError, CATALOG_COMPONENT};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: CatalogEntryId,
    pub blob_id: BlobId,
    pub course_id: CourseId,
    pub shortname: String,
    pub fullname: String,
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Listing filter. Name filters are case-insensitive substrings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CatalogFilter {
    pub shortname: Option<String>,
    pub fullname: Option<String>,
    pub course_id: Option<CourseId>,
}

fn contains_ci(haystack: &str, needle: &Option<String>) -> bool {
    match needle.as_deref().map(str::trim) {
        None | Some("") => true,
        Some(needle) => haystack.to_lowercase().contains(&needle.to_lowercase()),
    }
}

impl CatalogFilter {
    pub fn matches(&self, entry: &CatalogEntry) -> bool {
        self.course_id.is_none_or(|id| id == entry.course_id)
            && contains_ci(&entry.shortname, &self.shortname)
            && contains_ci(&entry.fullname, &self.fullname)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 500;

    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("backup not found: {0}")]
    NotFound(CatalogEntryId),
    #[error("blob of backup {0} is not a catalog backup")]
    NotABackup(CatalogEntryId),
    #[error(transparent)]
    Store(#[from] CatalogStoreError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error("restore failed: {0}")]
    Restore(#[from] ArchiveError),
}

pub struct BackupCatalog {
    store: Arc<dyn CatalogStore>,
    blobs: Arc<dyn BlobStore>,
    archives: Arc<dyn ArchiveService>,
    restore_timeout: Duration,
}

impl BackupCatalog {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        blobs: Arc<dyn BlobStore>,
        archives: Arc<dyn ArchiveService>,
        restore_timeout: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            archives,
            restore_timeout,
        }
    }

    /// Copy an archive into the catalog and write its entry.
    pub fn retain(&self, course: &Course, archive: &Archive, content: Bytes) -> Result<CatalogEntry, CatalogError> {
        let blob = self.blobs.save(CATALOG_COMPONENT, &archive.filename, content)?;
        let entry = CatalogEntry {
            id: CatalogEntryId::new(),
            blob_id: blob.id,
            course_id: course.id,
            shortname: course.shortname.clone(),
            fullname: course.fullname.clone(),
            filename: archive.filename.clone(),
            size_bytes: blob.metadata.size_bytes,
            content_hash: blob.metadata.content_hash.clone(),
            created_at: blob.metadata.created_at,
        };
        if let Err(e) = self.store.insert(&entry) {
            // Do not leave an unlisted copy behind.
            let _ = self.blobs.delete(blob.id);
            return Err(e.into());
        }
        info!(course_id = %course.id, entry_id = %entry.id, filename = %entry.filename, "backup retained");
        Ok(entry)
    }

    pub fn record(&self, entry: &CatalogEntry) -> Result<(), CatalogError> {
        Ok(self.store.insert(entry)?)
    }

    pub fn get(&self, id: CatalogEntryId) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.store.get(id)?)
    }

    /// Newest first.
    pub fn list(&self, filter: &CatalogFilter, page: Page) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.store.list(filter, page)?)
    }

    pub fn download(&self, id: CatalogEntryId) -> Result<(CatalogEntry, Bytes), CatalogError> {
        let entry = self.store.get(id)?.ok_or(CatalogError::NotFound(id))?;
        let blob = self.blobs.get(entry.blob_id)?.ok_or(CatalogError::NotFound(id))?;
        if blob.metadata.component != CATALOG_COMPONENT {
            return Err(CatalogError::NotABackup(id));
        }
        Ok((entry, blob.content))
    }

    /// Restore into a new course; returns its id.
    pub fn restore(&self, id: CatalogEntryId) -> Result<CourseId, CatalogError> {
        let entry = self.store.get(id)?.ok_or(CatalogError::NotFound(id))?;
        let blob = self.blobs.get(entry.blob_id)?.ok_or(CatalogError::NotFound(id))?;
        if blob.metadata.component != CATALOG_COMPONENT {
            return Err(CatalogError::NotABackup(id));
        }
        let course_id = self
            .archives
            .restore_archive(&blob, Deadline::after(self.restore_timeout))?;
        info!(entry_id = %id, source_course_id = %entry.course_id, course_id = %course_id, "backup restored");
        Ok(course_id)
    }

    pub fn delete(&self, id: CatalogEntryId) -> Result<(), CatalogError> {
        let entry = self.store.get(id)?.ok_or(CatalogError::NotFound(id))?;
        if !self.blobs.delete(entry.blob_id)? {
            warn!(entry_id = %id, blob_id = %entry.blob_id, "backup blob already gone");
        }
        self.store.delete(id)?;
        Ok(())
    }
}
