//! Per-key serializer
//!
//! The guardian is a table of exclusive locks keyed by account id. Work
//! touching several accounts locks all of their keys, always in sorted
//! order, so two multi-key operations can never deadlock each other.
//! Locks are released when the guard set drops, including during a panic
//! unwind, and entries nobody waits for are pruned on release.
//!
//! Locks are not reentrant: guarding a key already held by the calling task
//! waits forever unless a timeout is given.
//!
//! ```
//! use apolo_rating::Guardian;
//!
//! # tokio_test::block_on(async {
//! let guardian = Guardian::new();
//! let keys = vec!["t1:rif".to_string(), "t1:dan".to_string()];
//! let total = guardian
//!     .guard(&keys, None, || async { Ok(2 + 3) })
//!     .await
//!     .unwrap();
//! assert_eq!(total, 5);
//! # });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use apolo_core::{AppError, AppResult};
use parking_lot::Mutex;
use tokio::sync::{Mutex as KeyLock, OwnedMutexGuard};
use tracing::{debug, warn};

#[derive(Default)]
pub struct Guardian {
    locks: Mutex<HashMap<String, Arc<KeyLock<()>>>>,
}

/// Locks held for one unit of work
struct LockSet<'a> {
    guardian: &'a Guardian,
    keys: Vec<String>,
    held: Vec<OwnedMutexGuard<()>>,
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        self.held.clear();
        self.guardian.prune(&self.keys);
    }
}

impl Guardian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` while holding the locks of every key
    ///
    /// Keys are deduplicated and acquired in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` when the locks are not acquired within
    /// `timeout`; otherwise whatever `work` returns.
    pub async fn guard<F, Fut, T>(
        &self,
        keys: &[String],
        timeout: Option<Duration>,
        work: F,
    ) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let held = match self.acquire(&keys, timeout).await {
            Ok(held) => held,
            Err(e) => {
                self.prune(&keys);
                return Err(e);
            }
        };
        let _locks = LockSet {
            guardian: self,
            keys,
            held,
        };
        work().await
    }

    async fn acquire(
        &self,
        keys: &[String],
        timeout: Option<Duration>,
    ) -> AppResult<Vec<OwnedMutexGuard<()>>> {
        let mutexes: Vec<Arc<KeyLock<()>>> = {
            let mut table = self.locks.lock();
            keys.iter()
                .map(|k| Arc::clone(table.entry(k.clone()).or_default()))
                .collect()
        };
        let lock_all = async move {
            let mut held = Vec::with_capacity(mutexes.len());
            for m in mutexes {
                held.push(m.lock_owned().await);
            }
            held
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, lock_all).await.map_err(|_| {
                warn!("Timed out locking {:?}", keys);
                AppError::LockTimeout(keys.join(","))
            }),
            None => Ok(lock_all.await),
        }
    }

    fn prune(&self, keys: &[String]) {
        let mut table = self.locks.lock();
        for key in keys {
            if table
                .get(key)
                .map(|m| Arc::strong_count(m) == 1)
                .unwrap_or(false)
            {
                table.remove(key);
                debug!("Pruned lock {}", key);
            }
        }
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
