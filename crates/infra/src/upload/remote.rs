use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;

use lcbackup_core::{Deadline, S3Settings};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("invalid remote store configuration: {0}")]
    Config(String),
}

/// Client of one bucket in a remote object store.
pub trait RemoteStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Connectivity and permission check against the bucket.
    fn head_bucket(&self, deadline: Deadline) -> Result<(), RemoteError>;

    /// Whole-object upload.
    fn put_object(&self, key: &str, content: Bytes, deadline: Deadline) -> Result<(), RemoteError>;
}

/// Opens a client for a step instance's own remote settings.
pub trait RemoteStoreFactory: Send + Sync {
    fn open(&self, settings: &S3Settings) -> Result<Arc<dyn RemoteStore>, RemoteError>;
}

/// Remote store held in memory, with switchable failures.
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, Bytes>>,
    reachable: AtomicBool,
    fail_transfers: AtomicBool,
    puts: AtomicUsize,
}

impl InMemoryRemoteStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
            fail_transfers: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().ok()?.get(key).cloned()
    }

    /// Number of put attempts, failed ones included.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl RemoteStore for InMemoryRemoteStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn head_bucket(&self, deadline: Deadline) -> Result<(), RemoteError> {
        if deadline.is_expired() {
            return Err(RemoteError::Timeout);
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable(format!("bucket {} did not answer", self.bucket)));
        }
        Ok(())
    }

    fn put_object(&self, key: &str, content: Bytes, deadline: Deadline) -> Result<(), RemoteError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if deadline.is_expired() {
            return Err(RemoteError::Timeout);
        }
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(RemoteError::Transfer("connection reset by peer".to_string()));
        }
        self.objects
            .write()
            .map_err(|_| RemoteError::Transfer("object table lock poisoned".to_string()))?
            .insert(key.to_string(), content);
        Ok(())
    }
}

/// Hands out one [`InMemoryRemoteStore`] per bucket name.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStoreFactory {
    buckets: Mutex<BTreeMap<String, Arc<InMemoryRemoteStore>>>,
}

impl InMemoryRemoteStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind `bucket`, created on first use.
    pub fn bucket(&self, bucket: &str) -> Arc<InMemoryRemoteStore> {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Arc::new(InMemoryRemoteStore::new(bucket)))
            .clone()
    }
}

impl RemoteStoreFactory for InMemoryRemoteStoreFactory {
    fn open(&self, settings: &S3Settings) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        settings
            .validate()
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        Ok(self.bucket(&settings.bucket))
    }
}
