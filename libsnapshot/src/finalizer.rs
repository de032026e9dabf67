//! Deletion protection through finalizers.
//!
//! The controller keeps protection finalizers on requests and contents while
//! they are live or in use, and strips them once deletion was requested and
//! nothing depends on the object any more.  Removal re-reads the object and
//! retries on version conflicts with exponential backoff up to a deadline.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::Result;
use crate::store::ResourceStore;
use crate::types::{
    FINALIZER_CONTENT_BOUND, FINALIZER_REQUEST_AS_SOURCE, FINALIZER_REQUEST_BOUND,
    FINALIZER_REQUEST_IN_GROUP, Resource, SnapshotContent, SnapshotRequest,
};

/// A kind that carries controller-owned protection finalizers.
pub trait Protected: Resource {
    /// Every finalizer this controller may place on the kind.
    const PROTECTION_FINALIZERS: &'static [&'static str];

    /// Finalizers the object should carry in its current state.
    fn required_finalizers(&self) -> Vec<&'static str>;
}

impl Protected for SnapshotContent {
    const PROTECTION_FINALIZERS: &'static [&'static str] = &[FINALIZER_CONTENT_BOUND];

    fn required_finalizers(&self) -> Vec<&'static str> {
        vec![FINALIZER_CONTENT_BOUND]
    }
}

impl Protected for SnapshotRequest {
    const PROTECTION_FINALIZERS: &'static [&'static str] = &[
        FINALIZER_REQUEST_AS_SOURCE,
        FINALIZER_REQUEST_BOUND,
        FINALIZER_REQUEST_IN_GROUP,
    ];

    fn required_finalizers(&self) -> Vec<&'static str> {
        let mut required = vec![FINALIZER_REQUEST_AS_SOURCE];
        if self.bound_content_name().is_some() {
            required.push(FINALIZER_REQUEST_BOUND);
        }
        if self.group_snapshot_name().is_some() {
            required.push(FINALIZER_REQUEST_IN_GROUP);
        }
        required
    }
}

/// Required finalizers the object lacks.  Empty once deletion was requested.
pub fn missing_finalizers<K: Protected>(obj: &K) -> Vec<&'static str> {
    if obj.meta().is_being_deleted() {
        return Vec::new();
    }
    obj.required_finalizers()
        .into_iter()
        .filter(|f| !obj.meta().has_finalizer(f))
        .collect()
}

/// Whether [`missing_finalizers`] is non-empty.
pub fn needs_finalizer<K: Protected>(obj: &K) -> bool {
    !missing_finalizers(obj).is_empty()
}

/// Deletion was requested and at least one protection finalizer remains.
pub fn is_deletion_candidate<K: Protected>(obj: &K) -> bool {
    obj.meta().is_being_deleted()
        && K::PROTECTION_FINALIZERS
            .iter()
            .any(|f| obj.meta().has_finalizer(f))
}

/// Add `finalizers` to `obj` with a version-checked update.
pub async fn add_finalizers<K: Protected>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    finalizers: &[&str],
) -> Result<K> {
    let mut updated = obj.clone();
    let mut changed = false;
    for f in finalizers {
        changed |= updated.meta_mut().add_finalizer(f);
    }
    if !changed {
        return Ok(obj.clone());
    }
    let updated = store.update(updated).await?;
    debug!(kind = K::KIND, key = ?obj.key(), ?finalizers, "finalizers added");
    Ok(updated)
}

/// Result of [`remove_protection`].
#[derive(Debug)]
pub enum Removal<K> {
    /// The finalizers are gone.  Holds the stored object, if it still exists.
    Removed(Option<K>),
    /// Something still depends on the object; nothing was changed.
    InUse,
    /// The object no longer exists.
    Gone,
}

/// Conflict retry policy for finalizer removal.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: ExponentialBackoff,
    /// Give up once this much time has passed since the first attempt.
    pub deadline: Duration,
}

/// Strip the kind's protection finalizers from the named object.
///
/// Each attempt re-reads the object and consults `in_use` before writing, so
/// a dependency appearing between attempts still blocks removal.  Version
/// conflicts are retried per `policy`; other errors return immediately.
pub async fn remove_protection<K, F, Fut>(
    store: &dyn ResourceStore<K>,
    namespace: Option<&str>,
    name: &str,
    policy: RetryPolicy,
    mut in_use: F,
) -> Result<Removal<K>>
where
    K: Protected,
    F: FnMut(K) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut attempt = 0;
    loop {
        let Some(current) = store.get(namespace, name).await? else {
            return Ok(Removal::Gone);
        };
        if in_use(current.clone()).await? {
            debug!(kind = K::KIND, name, "object still in use, keeping finalizers");
            return Ok(Removal::InUse);
        }

        let mut updated = current.clone();
        let mut changed = false;
        for f in K::PROTECTION_FINALIZERS {
            changed |= updated.meta_mut().remove_finalizer(f);
        }
        if !changed {
            return Ok(Removal::Removed(Some(current)));
        }

        match store.update(updated).await {
            Ok(stored) => {
                info!(kind = K::KIND, name, "protection finalizers removed");
                let still_stored = store.get(namespace, name).await?.map(|_| stored);
                return Ok(Removal::Removed(still_stored));
            }
            Err(err) if err.is_conflict() && started.elapsed() < policy.deadline => {
                let delay = policy.backoff.delay(attempt);
                attempt += 1;
                debug!(kind = K::KIND, name, ?delay, "conflict removing finalizers, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(kind = K::KIND, name, error = %err, "failed to remove finalizers");
                return Err(err);
            }
        }
    }
}
