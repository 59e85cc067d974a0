//! The subscription multiplexer: a concurrency-safe map from subscription ID
//! to per-subscription state. Two flavors are provided, matching each side's
//! access pattern: a readers-writer-style lock for the server (many
//! concurrent per-message handlers reading/mutating concurrently) and a
//! plain mutual-exclusion lock for the client (shorter, simpler critical
//! sections).

use std::collections::HashMap;

use tokio::sync::RwLock;

/// Server-side registry: guarded by an async readers-writer lock since
/// per-message handlers run as independent tokio tasks and hold the lock
/// only for the duration of a map operation.
pub struct Registry<T> {
    inner: RwLock<HashMap<String, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `id`. Returns `false` without mutating the map
    /// if `id` is already present (duplicate subscribe is a server policy
    /// violation, not silently overwritten).
    pub async fn add(&self, id: String, value: T) -> bool {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&id) {
            return false;
        }
        guard.insert(id, value);
        true
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    /// Removes and returns the entry for `id`, if any. Idempotent: a second
    /// call on an already-removed ID simply returns `None`.
    pub async fn remove(&self, id: &str) -> Option<T> {
        self.inner.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Drains all entries, e.g. on connection teardown.
    pub async fn drain(&self) -> Vec<(String, T)> {
        self.inner.write().await.drain().collect()
    }
}

/// Client-side registry: guarded by a plain synchronous mutex, since
/// operations never await while holding the lock.
pub struct SyncRegistry<T> {
    inner: std::sync::Mutex<HashMap<String, T>>,
}

impl<T> Default for SyncRegistry<T> {
    fn default() -> Self {
        Self {
            inner: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SyncRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: String, value: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.contains_key(&id) {
            return false;
        }
        guard.insert(id, value);
        true
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn drain(&self) -> Vec<(String, T)> {
        self.inner.lock().unwrap().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let reg: Registry<u32> = Registry::new();
        assert!(reg.add("a".into(), 1).await);
        assert!(!reg.add("a".into(), 2).await);
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg: Registry<u32> = Registry::new();
        reg.add("a".into(), 1).await;
        assert_eq!(reg.remove("a").await, Some(1));
        assert_eq!(reg.remove("a").await, None);
    }

    #[test]
    fn sync_registry_rejects_duplicates() {
        let reg: SyncRegistry<u32> = SyncRegistry::new();
        assert!(reg.add("a".into(), 1));
        assert!(!reg.add("a".into(), 2));
        assert_eq!(reg.get("a"), Some(1));
    }
}
