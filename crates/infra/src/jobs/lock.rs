//! Per-course mutual exclusion with expiry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use lcbackup_core::CourseId;

/// Lock record as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub resource_key: CourseId,
    pub holder_id: String,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("lock storage error: {0}")]
    Storage(String),
}

/// Non-blocking lock keyed by course.
pub trait ExclusivityLock: Send + Sync {
    /// Take the lock if no unexpired lock exists for `key`. Never blocks.
    fn try_acquire(&self, key: CourseId, holder_id: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Remove the lock only if `holder_id` still holds it.
    fn release(&self, key: CourseId, holder_id: &str) -> Result<(), LockError>;
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Held lock; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a dyn ExclusivityLock,
    key: CourseId,
    holder_id: String,
}

impl<'a> LockGuard<'a> {
    /// Try to take `key` for `holder_id`. `None` when contended.
    pub fn acquire(
        lock: &'a dyn ExclusivityLock,
        key: CourseId,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        if !lock.try_acquire(key, holder_id, ttl)? {
            return Ok(None);
        }
        Ok(Some(Self {
            lock,
            key,
            holder_id: holder_id.to_string(),
        }))
    }

    pub fn key(&self) -> CourseId {
        self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release(self.key, &self.holder_id) {
            warn!(course_id = %self.key, holder = %self.holder_id, error = %e, "failed to release course lock");
        }
    }
}

/// In-memory lock table.
#[derive(Debug, Default)]
pub struct InMemoryExclusivityLock {
    locks: Mutex<HashMap<CourseId, LockRecord>>,
}

impl InMemoryExclusivityLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder, ignoring expired records.
    pub fn holder(&self, key: CourseId) -> Option<String> {
        let locks = self.locks.lock().ok()?;
        locks
            .get(&key)
            .filter(|r| !r.is_expired(Utc::now()))
            .map(|r| r.holder_id.clone())
    }
}

impl ExclusivityLock for InMemoryExclusivityLock {
    fn try_acquire(&self, key: CourseId, holder_id: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Storage("lock table poisoned".to_string()))?;
        let now = Utc::now();
        if let Some(existing) = locks.get(&key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        locks.insert(
            key,
            LockRecord {
                resource_key: key,
                holder_id: holder_id.to_string(),
                expires_at: expiry(now, ttl),
            },
        );
        Ok(true)
    }

    fn release(&self, key: CourseId, holder_id: &str) -> Result<(), LockError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LockError::Storage("lock table poisoned".to_string()))?;
        if locks.get(&key).is_some_and(|r| r.holder_id == holder_id) {
            locks.remove(&key);
        }
        Ok(())
    }
}
