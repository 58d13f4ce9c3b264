use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const MIN_PRUNE_AT: usize = 1024;

pub(crate) type KeyGuard = OwnedMutexGuard<()>;

/// Table of per-key async locks. Entries are held weakly and pruned once
/// the table grows, so only keys with a live guard or waiter keep a lock.
pub(crate) struct KeyLocks<K> {
    table: Mutex<LockTable<K>>,
}

struct LockTable<K> {
    locks: HashMap<K, Weak<AsyncMutex<()>>>,
    prune_at: usize,
}

impl<K: Eq + Hash + Ord + Clone> KeyLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            table: Mutex::new(LockTable {
                locks: HashMap::new(),
                prune_at: MIN_PRUNE_AT,
            }),
        }
    }

    fn handle(&self, key: &K) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = table.locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        if table.locks.len() >= table.prune_at {
            table.locks.retain(|_, lock| lock.strong_count() > 0);
            table.prune_at = (table.locks.len() * 2).max(MIN_PRUNE_AT);
        }
        let lock = Arc::new(AsyncMutex::new(()));
        table.locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    pub(crate) async fn lock(&self, key: &K) -> KeyGuard {
        self.handle(key).lock_owned().await
    }

    /// Locks two keys, always in key order, so concurrent pair lockers
    /// cannot deadlock.
    pub(crate) async fn lock_pair(&self, a: &K, b: &K) -> (KeyGuard, Option<KeyGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.lock(first).await;
        let second = self.lock(second).await;
        (first, Some(second))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .locks
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyLocks::<String>::new());
        let guard = locks.lock(&"a".to_string()).await;

        let other = Arc::clone(&locks);
        let waiter = tokio::spawn(async move {
            let _g = other.lock(&"a".to_string()).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::<String>::new();
        let _a = locks.lock(&"a".to_string()).await;
        let _b = locks.lock(&"b".to_string()).await;
        let (_c, d) = locks.lock_pair(&"d".to_string(), &"c".to_string()).await;
        assert!(d.is_some());
    }

    #[tokio::test]
    async fn test_dead_entries_are_pruned() {
        let locks = KeyLocks::<u64>::new();
        for i in 0..(MIN_PRUNE_AT as u64 * 3) {
            let _g = locks.lock(&i).await;
        }
        assert!(locks.len() <= MIN_PRUNE_AT + 1);
    }
}
