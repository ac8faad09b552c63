// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use vatgate_model::CacheKey;

/// One lazily created mutex per cache key. Entries live as long as the table.
#[derive(Default)]
pub struct RevalidationLockTable {
    locks: StdMutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl RevalidationLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Returns `None` when another task already holds the lock for `key`.
    pub fn try_acquire(&self, key: &CacheKey) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(key).try_lock_owned().ok()
    }

    pub async fn acquire(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        self.lock_for(key).lock_owned().await
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(c: char) -> CacheKey {
        CacheKey::parse(&c.to_string().repeat(64)).expect("key")
    }

    #[tokio::test]
    async fn try_acquire_skips_while_held() {
        let table = RevalidationLockTable::new();
        let guard = table.try_acquire(&key('a')).expect("first");
        assert!(table.try_acquire(&key('a')).is_none());
        assert!(table.try_acquire(&key('b')).is_some());
        drop(guard);
        assert!(table.try_acquire(&key('a')).is_some());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let table = Arc::new(RevalidationLockTable::new());
        let guard = table.acquire(&key('c')).await;
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                let _g = table.acquire(&key('c')).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finishes")
            .expect("join");
        assert_eq!(table.len(), 1);
    }
}
