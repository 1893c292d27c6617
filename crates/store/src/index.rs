//! Indexed store: current key -> object map with a namespace index.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mirra_core::{ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    by_ns: FxHashMap<Option<String>, FxHashSet<ObjectKey>>,
}

/// Shared handle to the cache snapshot.
///
/// Only the informer drain loop mutates it; everything else reads.
pub struct Store<K> {
    inner: Arc<RwLock<Inner<K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K: Resource> Default for Store<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(Inner { items: FxHashMap::default(), by_ns: FxHashMap::default() })) }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace; returns the previous object for the key.
    pub fn upsert(&self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = obj.key();
        let mut g = self.write();
        g.by_ns.entry(key.namespace.clone()).or_default().insert(key.clone());
        g.items.insert(key, obj)
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut g = self.write();
        let prev = g.items.remove(key)?;
        if let Some(set) = g.by_ns.get_mut(&key.namespace) {
            set.remove(key);
            if set.is_empty() {
                g.by_ns.remove(&key.namespace);
            }
        }
        Some(prev)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.read().items.contains_key(key)
    }

    /// All objects matching `pred`, in no particular order.
    pub fn list<F>(&self, pred: F) -> Vec<Arc<K>>
    where
        F: Fn(&K) -> bool,
    {
        self.read().items.values().filter(|o| pred(o)).cloned().collect()
    }

    /// Objects in one namespace matching `pred`; uses the namespace index.
    pub fn list_namespace<F>(&self, namespace: &str, pred: F) -> Vec<Arc<K>>
    where
        F: Fn(&K) -> bool,
    {
        let g = self.read();
        let Some(keys) = g.by_ns.get(&Some(namespace.to_string())) else {
            return Vec::new();
        };
        keys.iter().filter_map(|k| g.items.get(k)).filter(|o| pred(o)).cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }
}
