use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lcbackup_core::{JobId, ProcessId};

/// Lets a polling process find its in-flight job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessLink {
    pub process_id: ProcessId,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

impl ProcessLink {
    pub fn new(process_id: ProcessId, job_id: JobId) -> Self {
        Self {
            process_id,
            job_id,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessLinkError {
    #[error("process link storage error: {0}")]
    Storage(String),
}

/// One link per process.
pub trait ProcessLinkStore: Send + Sync {
    /// Returns `false` if the process already has a link; it is left untouched.
    fn insert(&self, link: ProcessLink) -> Result<bool, ProcessLinkError>;

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessLink>, ProcessLinkError>;

    fn delete(&self, process_id: ProcessId) -> Result<bool, ProcessLinkError>;
}

#[derive(Debug, Default)]
pub struct InMemoryProcessLinkStore {
    links: RwLock<HashMap<ProcessId, ProcessLink>>,
}

impl InMemoryProcessLinkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> ProcessLinkError {
    ProcessLinkError::Storage("process link lock poisoned".to_string())
}

impl ProcessLinkStore for InMemoryProcessLinkStore {
    fn insert(&self, link: ProcessLink) -> Result<bool, ProcessLinkError> {
        let mut links = self.links.write().map_err(|_| poisoned())?;
        if links.contains_key(&link.process_id) {
            return Ok(false);
        }
        links.insert(link.process_id, link);
        Ok(true)
    }

    fn get(&self, process_id: ProcessId) -> Result<Option<ProcessLink>, ProcessLinkError> {
        Ok(self.links.read().map_err(|_| poisoned())?.get(&process_id).cloned())
    }

    fn delete(&self, process_id: ProcessId) -> Result<bool, ProcessLinkError> {
        Ok(self.links.write().map_err(|_| poisoned())?.remove(&process_id).is_some())
    }
}
