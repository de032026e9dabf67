//! In-memory [`ResourceStore`] with Kubernetes-like write semantics.
//!
//! Every write bumps a store-wide resource version, `update` enforces
//! optimistic concurrency, `delete` honours finalizers and every change is
//! published on a broadcast channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ListParams, ResourceStore, WatchEvent};
use crate::error::{Result, SnapshotError};
use crate::patch::apply_merge_patch;
use crate::types::{Resource, object_key};

const WATCH_CAPACITY: usize = 1024;

/// Process-local store for one kind.
pub struct MemoryStore<K: Resource> {
    objects: Mutex<BTreeMap<String, K>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent<K>>,
    /// Number of upcoming `update` calls that fail with a conflict.
    injected_conflicts: AtomicUsize,
}

impl<K: Resource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> MemoryStore<K> {
    /// An empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            events,
            injected_conflicts: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` calls to `update` fail with a conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Synchronous snapshot of an object, for assertions.
    pub fn peek(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.objects.lock().get(&object_key(namespace, name)).cloned()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn publish(&self, event: WatchEvent<K>) {
        // No subscriber is not an error.
        let _ = self.events.send(event);
    }

    /// Store `obj` over `stored`, dropping it instead when a pending deletion
    /// just lost its last finalizer.
    fn commit(&self, objects: &mut BTreeMap<String, K>, key: String, stored: &K, mut obj: K) -> K {
        let meta = obj.meta_mut();
        meta.uid = stored.meta().uid.clone();
        meta.creation_timestamp = stored.meta().creation_timestamp;
        meta.deletion_timestamp = stored.meta().deletion_timestamp;
        meta.resource_version = self.next_version();

        if meta.deletion_timestamp.is_some() && meta.finalizers.is_none() {
            debug!(kind = K::KIND, %key, "last finalizer removed, object deleted");
            objects.remove(&key);
            self.publish(WatchEvent::Deleted(obj.clone()));
        } else {
            objects.insert(key, obj.clone());
            self.publish(WatchEvent::Modified(obj.clone()));
        }
        obj
    }
}

#[async_trait]
impl<K: Resource> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        Ok(self.peek(namespace, name))
    }

    async fn list(&self, params: &ListParams) -> Result<Vec<K>> {
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|obj| params.matches(obj.meta()))
            .cloned()
            .collect())
    }

    async fn create(&self, mut obj: K) -> Result<K> {
        let key = obj.key()?;
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(SnapshotError::AlreadyExists {
                kind: K::KIND,
                key,
            });
        }

        let meta = obj.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;
        meta.resource_version = self.next_version();

        objects.insert(key, obj.clone());
        self.publish(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, obj: K) -> Result<K> {
        let key = obj.key()?;
        let mut objects = self.objects.lock();
        let stored = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(K::KIND, key.clone()))?;

        let version = &obj.meta().resource_version;
        if self.take_injected_conflict()
            || (!version.is_empty() && *version != stored.meta().resource_version)
        {
            return Err(SnapshotError::conflict(K::KIND, key));
        }
        Ok(self.commit(&mut objects, key, &stored, obj))
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &[u8]) -> Result<K> {
        let key = object_key(namespace, name);
        let patch: serde_json::Value = serde_json::from_slice(patch)?;
        let mut objects = self.objects.lock();
        let stored = objects
            .get(&key)
            .cloned()
            .ok_or_else(|| SnapshotError::not_found(K::KIND, key.clone()))?;

        let mut value = serde_json::to_value(&stored)?;
        apply_merge_patch(&mut value, &patch);
        let mut patched: K = serde_json::from_value(value)?;
        let meta = patched.meta_mut();
        meta.name = stored.meta().name.clone();
        meta.namespace = stored.meta().namespace.clone();
        Ok(self.commit(&mut objects, key, &stored, patched))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = object_key(namespace, name);
        let mut objects = self.objects.lock();
        let Some(stored) = objects.get(&key).cloned() else {
            return Err(SnapshotError::not_found(K::KIND, key));
        };

        if stored.meta().finalizers.is_none() {
            objects.remove(&key);
            self.publish(WatchEvent::Deleted(stored));
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_some() {
            return Ok(());
        }

        let mut marked = stored;
        let meta = marked.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = self.next_version();
        objects.insert(key, marked.clone());
        self.publish(WatchEvent::Modified(marked));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<K>> {
        self.events.subscribe()
    }
}
