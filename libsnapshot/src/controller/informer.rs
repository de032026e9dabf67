//! Change-stream pumps feeding the caches and work queues.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::SnapshotController;
use crate::cache::ObjectCache;
use crate::store::{ListParams, ResourceStore, WatchEvent};
use crate::types::{Resource, SnapshotContent, SnapshotRequest, VolumeClaim, object_key};

/// A kind the controller watches.
pub(super) trait Informed: Resource {
    fn store(ctrl: &SnapshotController) -> &Arc<dyn ResourceStore<Self>>;

    /// Mirror of the kind, if the controller keeps one.
    fn cache(_ctrl: &SnapshotController) -> Option<&ObjectCache<Self>> {
        None
    }

    fn on_update(ctrl: &SnapshotController, obj: Self);

    fn on_delete(ctrl: &SnapshotController, obj: Self);
}

impl Informed for SnapshotRequest {
    fn store(ctrl: &SnapshotController) -> &Arc<dyn ResourceStore<Self>> {
        &ctrl.requests
    }

    fn cache(ctrl: &SnapshotController) -> Option<&ObjectCache<Self>> {
        Some(&ctrl.request_cache)
    }

    fn on_update(ctrl: &SnapshotController, obj: Self) {
        let Ok(key) = obj.key() else { return };
        match ctrl.request_cache.update(obj) {
            Ok(true) => ctrl.request_queue.add(&key),
            Ok(false) => {}
            Err(err) => warn!(%key, error = %err, "dropping snapshot request notification"),
        }
    }

    fn on_delete(ctrl: &SnapshotController, obj: Self) {
        let Ok(key) = obj.key() else { return };
        ctrl.request_cache.delete(&key);
        ctrl.request_queue.forget(&key);
        if let Some(content) = obj.bound_content_name() {
            ctrl.content_queue.add(content);
        }
        debug!(%key, "snapshot request deleted");
    }
}

impl Informed for SnapshotContent {
    fn store(ctrl: &SnapshotController) -> &Arc<dyn ResourceStore<Self>> {
        &ctrl.contents
    }

    fn cache(ctrl: &SnapshotController) -> Option<&ObjectCache<Self>> {
        Some(&ctrl.content_cache)
    }

    fn on_update(ctrl: &SnapshotController, obj: Self) {
        let Ok(key) = obj.key() else { return };
        let request_key = obj
            .spec
            .request_ref
            .as_ref()
            .map(|r| object_key(Some(&r.namespace), &r.name));
        match ctrl.content_cache.update(obj) {
            Ok(true) => {
                ctrl.content_queue.add(&key);
                if let Some(request_key) = request_key
                    && ctrl.request_cache.contains(&request_key)
                {
                    ctrl.request_queue.add(&request_key);
                }
            }
            Ok(false) => {}
            Err(err) => warn!(%key, error = %err, "dropping snapshot content notification"),
        }
    }

    fn on_delete(ctrl: &SnapshotController, obj: Self) {
        let Ok(key) = obj.key() else { return };
        ctrl.content_cache.delete(&key);
        ctrl.content_queue.forget(&key);
        if let Some(r) = &obj.spec.request_ref {
            let request_key = object_key(Some(&r.namespace), &r.name);
            if ctrl.request_cache.contains(&request_key) {
                ctrl.request_queue.add(&request_key);
            }
        }
        debug!(%key, "snapshot content deleted");
    }
}

impl Informed for VolumeClaim {
    fn store(ctrl: &SnapshotController) -> &Arc<dyn ResourceStore<Self>> {
        &ctrl.claims
    }

    /// Claims matter as snapshot sources and as restore targets.
    fn on_update(ctrl: &SnapshotController, obj: Self) {
        let namespace = obj.metadata.namespace.as_deref();
        if let Some(snapshot) = obj.spec.data_source_snapshot.as_deref() {
            let key = object_key(namespace, snapshot);
            if ctrl.request_cache.contains(&key) {
                ctrl.request_queue.add(&key);
            }
        }
        for request in ctrl.request_cache.list() {
            if request.metadata.namespace.as_deref() == namespace
                && request.spec.source.volume_claim_name.as_deref()
                    == Some(obj.metadata.name.as_str())
                && !request.is_ready()
                && let Ok(key) = request.key()
            {
                ctrl.request_queue.add(&key);
            }
        }
    }

    fn on_delete(ctrl: &SnapshotController, obj: Self) {
        Self::on_update(ctrl, obj);
    }
}

impl SnapshotController {
    /// Consume the change stream of one kind until shutdown, relisting on
    /// lag and every resync period.
    pub(super) async fn run_informer<K: Informed>(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = K::store(&self).watch();
        let mut resync = tokio::time::interval(self.config.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = resync.tick() => self.relist::<K>().await,
                event = events.recv() => match event {
                    Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj)) => {
                        trace!(kind = K::KIND, name = %obj.meta().name, "update notification");
                        K::on_update(&self, obj);
                    }
                    Ok(WatchEvent::Deleted(obj)) => K::on_delete(&self, obj),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(kind = K::KIND, missed, "change stream lagged, relisting");
                        self.relist::<K>().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(kind = K::KIND, "informer stopped");
    }

    /// List every object of the kind, replay it as an update and replay
    /// cached objects missing from the listing as deletions.
    async fn relist<K: Informed>(&self) {
        let objects = match K::store(self).list(&ListParams::default()).await {
            Ok(objects) => objects,
            Err(err) => {
                warn!(kind = K::KIND, error = %err, "relist failed");
                return;
            }
        };

        if let Some(cache) = K::cache(self) {
            let live: HashSet<String> = objects.iter().filter_map(|o| o.key().ok()).collect();
            for key in cache.keys() {
                if !live.contains(&key)
                    && let Some(gone) = cache.get(&key)
                {
                    K::on_delete(self, gone);
                }
            }
        }
        debug!(kind = K::KIND, count = objects.len(), "relisted");
        for obj in objects {
            K::on_update(self, obj);
        }
    }

    /// Relist requests and contents once, filling the caches and queueing
    /// every key.
    pub async fn resync(&self) {
        self.relist::<SnapshotRequest>().await;
        self.relist::<SnapshotContent>().await;
    }
}
