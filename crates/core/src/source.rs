//! The list + watch capability the engine consumes.

use futures::stream::BoxStream;

use crate::Resource;

/// Result of a full listing.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// A change observed on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker without an object change.
    Bookmark(String),
}

impl<K: Resource> WatchEvent<K> {
    /// Resource version this event advances the stream to.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o.resource_version(),
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Network failure, timeout, server busy. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The requested resource version is no longer served; a relist is required.
    #[error("stale resource version: {0}")]
    StaleVersion(String),
}

impl SourceError {
    pub fn is_stale(&self) -> bool {
        matches!(self, SourceError::StaleVersion(_))
    }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// Remote collection the informer mirrors.
#[async_trait::async_trait]
pub trait Source: Send + Sync + 'static {
    type Object: Resource;

    async fn list(&self) -> Result<ObjectList<Self::Object>, SourceError>;

    /// Open a change stream starting after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Self::Object>, SourceError>;
}
