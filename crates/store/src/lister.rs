//! Read-only query façade over the store.

use std::sync::Arc;

use mirra_core::{LabelSelector, ObjectKey, Resource};

use crate::Store;

/// Filtered, non-blocking reads of the current snapshot. Results are unordered.
pub struct Lister<K> {
    store: Store<K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone() }
    }
}

impl<K: Resource> Lister<K> {
    pub fn new(store: Store<K>) -> Self {
        Self { store }
    }

    /// Objects across all namespaces matching `selector`.
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        self.store.list(|o| selector.matches(o.labels()))
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.store.get(key)
    }

    /// Scope reads to one namespace.
    pub fn namespace(&self, namespace: &str) -> NamespaceLister<K> {
        NamespaceLister { store: self.store.clone(), namespace: namespace.to_string() }
    }
}

pub struct NamespaceLister<K> {
    store: Store<K>,
    namespace: String,
}

impl<K: Resource> NamespaceLister<K> {
    pub fn list(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        self.store.list_namespace(&self.namespace, |o| selector.matches(o.labels()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectKey::namespaced(&self.namespace, name))
    }
}
