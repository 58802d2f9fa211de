//! Named advisory lock manager
//!
//! Process-wide exclusive locks keyed by name. The database apply path
//! serializes all writers through the `"roomy-query-lock"` name; without
//! it, nested savepoints of concurrent callers interleave and corrupt
//! the store.
//!
//! Three acquisition modes: [`LockManager::lock`] awaits,
//! [`LockManager::try_lock`] is the non-blocking `ifAvailable` poll, and
//! [`LockManager::lock_timeout`] gives up after a deadline (the
//! abort-signal mode). Dropping the returned [`LockGuard`] releases.
//!
//! Liveness across *processes* is not this crate's job: the active
//! writer proves itself with a heartbeat record in the durable KV, and a
//! peer steals writership when that record goes stale.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::Snafu;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum LockError {
    #[snafu(display("Timed out waiting for lock `{name}`"))]
    Timeout { name: String },
}

pub type LockResult<T> = std::result::Result<T, LockError>;

#[derive(Clone, Default)]
pub struct LockManager {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("Locking failed")
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Acquire exclusively, waiting as long as it takes.
    pub async fn lock(&self, name: &str) -> LockGuard {
        let entry = self.entry(name);
        LockGuard {
            name: name.to_owned(),
            _guard: entry.lock_owned().await,
        }
    }

    /// The `ifAvailable` poll: `None` when someone else holds the lock.
    pub fn try_lock(&self, name: &str) -> Option<LockGuard> {
        let entry = self.entry(name);
        entry.try_lock_owned().ok().map(|guard| LockGuard {
            name: name.to_owned(),
            _guard: guard,
        })
    }

    /// Acquire with a deadline.
    pub async fn lock_timeout(&self, name: &str, timeout: Duration) -> LockResult<LockGuard> {
        match tokio::time::timeout(timeout, self.lock(name)).await {
            Ok(guard) => Ok(guard),
            Err(_elapsed) => TimeoutSnafu { name }.fail(),
        }
    }
}

/// Held for the duration of exclusive access; release on drop.
pub struct LockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LockGuard({})", self.name)
    }
}

#[cfg(test)]
mod tests;
