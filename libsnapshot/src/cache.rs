//! Resource-version-aware object cache.
//!
//! [`ObjectCache`] mirrors the authoritative store for one object kind.  Its
//! only write path, [`ObjectCache::update`], rejects notifications whose
//! resource version is strictly older than the cached copy so that a delayed
//! watch event can never roll the cache back.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::{Result, SnapshotError};
use crate::types::Resource;

/// Parse a resource version as an ordered integer token.
pub fn parse_resource_version(version: &str) -> Result<u64> {
    version
        .parse::<u64>()
        .map_err(|_| SnapshotError::InvalidResourceVersion(version.to_owned()))
}

/// Keyed in-memory mirror of one kind.
///
/// # Thread safety
///
/// Entries live in a [`DashMap`]; the compare-and-replace in
/// [`ObjectCache::update`] happens under the shard lock of the entry, and no
/// lock is held once a method returns.
#[derive(Debug)]
pub struct ObjectCache<K: Resource> {
    objects: DashMap<String, K>,
}

impl<K: Resource> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> ObjectCache<K> {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    /// Insert or replace `obj` unless the cached copy is strictly newer.
    ///
    /// Returns `Ok(true)` when the cache now holds `obj`, `Ok(false)` when the
    /// incoming object was stale.  Equal versions are accepted so periodic
    /// resyncs are processed as real work.
    pub fn update(&self, obj: K) -> Result<bool> {
        let key = obj.key()?;
        let incoming = parse_resource_version(&obj.meta().resource_version)?;

        match self.objects.entry(key) {
            Entry::Vacant(slot) => {
                debug!(kind = K::KIND, key = %slot.key(), version = incoming, "cache insert");
                slot.insert(obj);
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let cached = parse_resource_version(&slot.get().meta().resource_version)?;
                if incoming < cached {
                    debug!(
                        kind = K::KIND,
                        key = %slot.key(),
                        incoming,
                        cached,
                        "ignoring stale object"
                    );
                    return Ok(false);
                }
                slot.insert(obj);
                Ok(true)
            }
        }
    }

    /// Return an independent copy of the cached object.
    pub fn get(&self, key: &str) -> Option<K> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    /// Whether `key` is cached.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Drop `key`, returning the evicted object.
    pub fn delete(&self, key: &str) -> Option<K> {
        self.objects.remove(key).map(|(_, obj)| obj)
    }

    /// Copies of every cached object.
    pub fn list(&self) -> Vec<K> {
        self.objects
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Every cached key.
    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
