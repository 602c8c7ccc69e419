use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-key async mutexes, created on first use.
///
/// Unrelated keys never contend. Entries are kept for the life of the
/// registry; the key space (services, sales point and voucher type pairs) is small.
pub struct KeyedLock<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedLock<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLock<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is free and holds it until the guard is dropped.
    pub async fn lock(&self, key: K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key).or_default())
        };
        mutex.lock_owned().await
    }
}
