//! Blob storage for archive content.
//!
//! Stands in for the host's file storage: content addressed by [`BlobId`],
//! tagged with the component that owns it and a SHA-1 content hash.

mod fs;

pub use fs::FsBlobStore;

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use lcbackup_core::BlobId;

/// Component of archives produced by the archive engine.
pub const ARCHIVE_COMPONENT: &str = "backup";

/// Component of catalog copies kept after a job finishes.
pub const CATALOG_COMPONENT: &str = "lcbackup_catalog";

/// Lowercase hex SHA-1 of `content`.
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha1::digest(content))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub component: String,
    pub filename: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl BlobMetadata {
    pub fn describe(component: &str, filename: &str, content: &[u8]) -> Self {
        Self {
            component: component.to_string(),
            filename: filename.to_string(),
            content_hash: content_hash(content),
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    pub content: Bytes,
    pub metadata: BlobMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobStoreError {
    #[error("blob not found: {0}")]
    NotFound(BlobId),
    #[error("blob io error: {0}")]
    Io(String),
    #[error("blob storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for BlobStoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

pub trait BlobStore: Send + Sync {
    /// Store `content`; the hash and size are computed here.
    fn save(&self, component: &str, filename: &str, content: Bytes) -> Result<Blob, BlobStoreError>;

    fn get(&self, id: BlobId) -> Result<Option<Blob>, BlobStoreError>;

    /// Returns whether the blob existed.
    fn delete(&self, id: BlobId) -> Result<bool, BlobStoreError>;
}

/// Blobs held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobId, Blob>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of blobs owned by `component`.
    pub fn count_component(&self, component: &str) -> usize {
        self.blobs
            .read()
            .map(|b| b.values().filter(|blob| blob.metadata.component == component).count())
            .unwrap_or(0)
    }
}

fn poisoned() -> BlobStoreError {
    BlobStoreError::Storage("blob table lock poisoned".to_string())
}

impl BlobStore for InMemoryBlobStore {
    fn save(&self, component: &str, filename: &str, content: Bytes) -> Result<Blob, BlobStoreError> {
        let blob = Blob {
            id: BlobId::new(),
            metadata: BlobMetadata::describe(component, filename, &content),
            content,
        };
        self.blobs
            .write()
            .map_err(|_| poisoned())?
            .insert(blob.id, blob.clone());
        Ok(blob)
    }

    fn get(&self, id: BlobId) -> Result<Option<Blob>, BlobStoreError> {
        Ok(self.blobs.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    fn delete(&self, id: BlobId) -> Result<bool, BlobStoreError> {
        Ok(self.blobs.write().map_err(|_| poisoned())?.remove(&id).is_some())
    }
}
