//! Authoritative object store abstraction.
//!
//! The controller never owns durable state.  It reads and writes objects
//! through [`ResourceStore`], one instance per kind, and learns about changes
//! made by other writers through the store's change stream.  All writes are
//! optimistic: `update` fails with [`SnapshotError::Conflict`] when the
//! caller's resource version is stale.
//!
//! [`SnapshotError::Conflict`]: crate::error::SnapshotError::Conflict

pub mod memory;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{ObjectMeta, Resource};

pub use memory::MemoryStore;

/// A change notification delivered by [`ResourceStore::watch`].
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

/// Filter for [`ResourceStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Restrict to one namespace.
    pub namespace: Option<String>,
}

impl ListParams {
    /// Objects in namespace `ns`.
    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
        }
    }

    /// Whether an object with `meta` passes the filter.
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        self.namespace
            .as_deref()
            .is_none_or(|ns| meta.namespace.as_deref() == Some(ns))
    }
}

/// CRUD + watch access to one object kind.
#[async_trait]
pub trait ResourceStore<K: Resource>: Send + Sync {
    /// Fetch an object.  `Ok(None)` when it does not exist.
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>>;

    async fn list(&self, params: &ListParams) -> Result<Vec<K>>;

    /// Create an object.  Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, obj: K) -> Result<K>;

    /// Replace an object.  Fails with `Conflict` on a stale resource version.
    async fn update(&self, obj: K) -> Result<K>;

    /// Apply an RFC 7386 JSON merge patch.
    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &[u8]) -> Result<K>;

    /// Request deletion.  Objects carrying finalizers only get a deletion
    /// timestamp; they disappear once the last finalizer is removed.
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>>;
}
