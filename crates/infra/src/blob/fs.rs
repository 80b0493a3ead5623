use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use lcbackup_core::BlobId;

use super::{Blob, BlobMetadata, BlobStore, BlobStoreError};

/// Blobs on local disk: `<root>/<id>.blob` plus a `<id>.json` metadata sidecar.
///
/// Content is written to a temporary file first and renamed into place, so a
/// reader never sees a partial blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BlobStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_path(&self, id: BlobId) -> PathBuf {
        self.root.join(format!("{id}.blob"))
    }

    fn metadata_path(&self, id: BlobId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), BlobStoreError> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, BlobStoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl BlobStore for FsBlobStore {
    fn save(&self, component: &str, filename: &str, content: Bytes) -> Result<Blob, BlobStoreError> {
        let id = BlobId::new();
        let metadata = BlobMetadata::describe(component, filename, &content);
        let sidecar =
            serde_json::to_vec(&metadata).map_err(|e| BlobStoreError::Storage(e.to_string()))?;

        self.write_atomic(&self.content_path(id), &content)?;
        self.write_atomic(&self.metadata_path(id), &sidecar)?;
        debug!(blob_id = %id, component, filename, size = metadata.size_bytes, "blob saved");

        Ok(Blob {
            id,
            content,
            metadata,
        })
    }

    fn get(&self, id: BlobId) -> Result<Option<Blob>, BlobStoreError> {
        let sidecar = match fs::read(self.metadata_path(id)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata: BlobMetadata =
            serde_json::from_slice(&sidecar).map_err(|e| BlobStoreError::Storage(e.to_string()))?;
        let content = match fs::read(self.content_path(id)) {
            Ok(data) => Bytes::from(data),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Blob {
            id,
            content,
            metadata,
        }))
    }

    fn delete(&self, id: BlobId) -> Result<bool, BlobStoreError> {
        let had_metadata = remove_if_exists(&self.metadata_path(id))?;
        let had_content = remove_if_exists(&self.content_path(id))?;
        Ok(had_metadata || had_content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{content_hash, CATALOG_COMPONENT};

    #[test]
    fn blobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs")).unwrap();
        let blob = store
            .save(CATALOG_COMPONENT, "backup.mbz", Bytes::from_static(b"course data"))
            .unwrap();

        let reopened = FsBlobStore::open(store.root()).unwrap();
        let loaded = reopened.get(blob.id).unwrap().unwrap();
        assert_eq!(loaded.content, Bytes::from_static(b"course data"));
        assert_eq!(loaded.metadata.component, CATALOG_COMPONENT);
        assert_eq!(loaded.metadata.content_hash, content_hash(b"course data"));
    }

    #[test]
    fn delete_removes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let blob = store.save("backup", "x.mbz", Bytes::from_static(b"x")).unwrap();

        assert!(store.delete(blob.id).unwrap());
        assert!(store.get(blob.id).unwrap().is_none());
        assert!(!store.delete(blob.id).unwrap());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
