use std::collections::HashMap;
use std::sync::RwLock;

use lcbackup_core::CatalogEntryId;

use super::{CatalogEntry, CatalogFilter, Page};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogStoreError {
    #[error("catalog entry already exists: {0}")]
    Duplicate(CatalogEntryId),
    #[error("catalog storage error: {0}")]
    Storage(String),
}

pub trait CatalogStore: Send + Sync {
    fn insert(&self, entry: &CatalogEntry) -> Result<(), CatalogStoreError>;

    fn get(&self, id: CatalogEntryId) -> Result<Option<CatalogEntry>, CatalogStoreError>;

    /// Matching entries, newest first.
    fn list(&self, filter: &CatalogFilter, page: Page) -> Result<Vec<CatalogEntry>, CatalogStoreError>;

    fn delete(&self, id: CatalogEntryId) -> Result<bool, CatalogStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalogStore {
    entries: RwLock<HashMap<CatalogEntryId, CatalogEntry>>,
}

impl InMemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> CatalogStoreError {
    CatalogStoreError::Storage("catalog lock poisoned".to_string())
}

impl CatalogStore for InMemoryCatalogStore {
    fn insert(&self, entry: &CatalogEntry) -> Result<(), CatalogStoreError> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        if entries.contains_key(&entry.id) {
            return Err(CatalogStoreError::Duplicate(entry.id));
        }
        entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn get(&self, id: CatalogEntryId) -> Result<Option<CatalogEntry>, CatalogStoreError> {
        Ok(self.entries.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    fn list(&self, filter: &CatalogFilter, page: Page) -> Result<Vec<CatalogEntry>, CatalogStoreError> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let mut matched: Vec<_> = entries.values().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(matched.into_iter().skip(page.offset).take(page.limit).collect())
    }

    fn delete(&self, id: CatalogEntryId) -> Result<bool, CatalogStoreError> {
        Ok(self.entries.write().map_err(|_| poisoned())?.remove(&id).is_some())
    }
}
