//! Mirra core types: keys, objects, deltas and the resource source contract.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod config;
mod selector;
mod source;

pub use config::InformerConfig;
pub use selector::{LabelSelector, Requirement, SelectorError};
pub use source::{ObjectList, Source, SourceError, WatchEvent, WatchStream};

/// Label pairs as stored on objects.
pub type Labels = SmallVec<[(String, String); 8]>;

/// Stable identity of an object within one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    pub fn cluster(name: &str) -> Self {
        Self::new(None, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Anything the engine can mirror.
///
/// Objects are treated as immutable once observed; the engine only ever
/// hands out shared references to them.
pub trait Resource: Send + Sync + 'static {
    fn key(&self) -> ObjectKey;

    /// Opaque progress token carried by the object, if any.
    fn resource_version(&self) -> Option<&str>;

    fn labels(&self) -> &[(String, String)];

    fn namespace(&self) -> Option<&str>;
}

/// Generic object as produced by the kube adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: String,
    /// Unix seconds; 0 when unknown.
    pub creation_ts: i64,
    pub labels: Labels,
    /// Raw object (managedFields stripped)
    pub raw: serde_json::Value,
}

impl Object {
    pub fn new(namespace: Option<&str>, name: &str, resource_version: &str) -> Self {
        Self {
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
            resource_version: resource_version.to_string(),
            creation_ts: 0,
            labels: Labels::new(),
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        self.labels = labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        self
    }
}

impl Resource for Object {
    fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace.clone(), name: self.name.clone() }
    }

    fn resource_version(&self) -> Option<&str> {
        if self.resource_version.is_empty() { None } else { Some(&self.resource_version) }
    }

    fn labels(&self) -> &[(String, String)] {
        &self.labels
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic re-delivery of an unchanged object.
    Resynced,
}

/// One pending change for a key, as buffered by the delta queue.
#[derive(Debug)]
pub struct Delta<K> {
    pub key: ObjectKey,
    pub kind: DeltaKind,
    pub object: std::sync::Arc<K>,
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self { key: self.key.clone(), kind: self.kind, object: self.object.clone() }
    }
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, InformerConfig, LabelSelector, Labels, Object, ObjectKey, ObjectList,
        Resource, Source, SourceError, WatchEvent, WatchStream,
    };
}
