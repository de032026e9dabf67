//! Snapshot reconciler.
//!
//! [`SnapshotController`] drives every [`SnapshotRequest`] and
//! [`SnapshotContent`] towards a bound, ready pair, and tears both down
//! again when the user deletes the request.  It is level-triggered: each
//! sync reads the current cached object, decides the next step from scratch
//! and performs at most a few store writes.  Slow backend work runs as named
//! operations through [`OperationDeduplicator`].
//!
//! ```text
//!  store watch ──► informer ──► ObjectCache ──► WorkQueue ──► worker ──► sync_*
//!                                                                  │
//!                                         OperationDeduplicator ◄──┘
//! ```

mod content;
mod informer;
mod request;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendCapability, SnapshotBackend};
use crate::cache::ObjectCache;
use crate::class::ClassResolver;
use crate::config::ControllerConfig;
use crate::error::{Result, SnapshotError};
use crate::events::{EventRecorder, EventType, event};
use crate::operation::OperationDeduplicator;
use crate::patch::object_merge_patch;
use crate::queue::WorkQueue;
use crate::secret::{SecretResolver, SecretSource};
use crate::store::ResourceStore;
use crate::types::{
    ErrorRecord, Resource, SnapshotClass, SnapshotContent, SnapshotContentStatus,
    SnapshotRequest, SnapshotRequestStatus, VolumeClaim, object_key,
};

/// External systems the controller talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub requests: Arc<dyn ResourceStore<SnapshotRequest>>,
    pub contents: Arc<dyn ResourceStore<SnapshotContent>>,
    pub classes: Arc<dyn ResourceStore<SnapshotClass>>,
    pub claims: Arc<dyn ResourceStore<VolumeClaim>>,
    pub backend: Arc<dyn SnapshotBackend>,
    pub secrets: Arc<dyn SecretSource>,
    pub recorder: Arc<dyn EventRecorder>,
}

/// The reconciler.
pub struct SnapshotController {
    config: ControllerConfig,
    /// Driver name reported by the backend.  Contents and classes of other
    /// drivers are ignored.
    driver: String,
    /// Whether the backend reports snapshot status on its own.
    status_supported: bool,

    requests: Arc<dyn ResourceStore<SnapshotRequest>>,
    contents: Arc<dyn ResourceStore<SnapshotContent>>,
    claims: Arc<dyn ResourceStore<VolumeClaim>>,
    backend: Arc<dyn SnapshotBackend>,
    classes: ClassResolver<SnapshotClass>,
    secrets: SecretResolver<dyn SecretSource>,
    recorder: Arc<dyn EventRecorder>,

    request_cache: ObjectCache<SnapshotRequest>,
    content_cache: ObjectCache<SnapshotContent>,
    request_queue: Arc<WorkQueue>,
    content_queue: Arc<WorkQueue>,
    operations: OperationDeduplicator,
}

impl SnapshotController {
    /// Validate `config`, probe the backend and build the controller.
    ///
    /// Fails when the backend cannot create and delete snapshots.
    pub async fn new(config: ControllerConfig, c: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        let timeout = config.operation_timeout;

        let driver = tokio::time::timeout(timeout, c.backend.get_driver_name())
            .await
            .map_err(|_| SnapshotError::Timeout(timeout))??;
        let can_create = tokio::time::timeout(
            timeout,
            c.backend.supports(BackendCapability::CreateDeleteSnapshot),
        )
        .await
        .map_err(|_| SnapshotError::Timeout(timeout))??;
        if !can_create {
            return Err(SnapshotError::InvalidArgument(format!(
                "driver {driver} does not support creating and deleting snapshots"
            )));
        }
        let status_supported = tokio::time::timeout(
            timeout,
            c.backend.supports(BackendCapability::GetSnapshotStatus),
        )
        .await
        .map_err(|_| SnapshotError::Timeout(timeout))??;
        info!(%driver, status_supported, "snapshot controller initialised");

        Ok(Arc::new(Self {
            request_queue: WorkQueue::new(
                "snapshot-requests",
                config.queue_base_delay,
                config.queue_max_delay,
            ),
            content_queue: WorkQueue::new(
                "snapshot-contents",
                config.queue_base_delay,
                config.queue_max_delay,
            ),
            operations: OperationDeduplicator::new(
                config.operation_backoff_initial,
                config.operation_backoff_max,
            ),
            config,
            driver,
            status_supported,
            requests: c.requests,
            contents: c.contents,
            claims: c.claims,
            backend: c.backend,
            classes: ClassResolver::new(c.classes),
            secrets: SecretResolver::new(c.secrets),
            recorder: c.recorder,
            request_cache: ObjectCache::new(),
            content_cache: ObjectCache::new(),
        }))
    }

    /// Driver name reported by the backend.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn request_cache(&self) -> &ObjectCache<SnapshotRequest> {
        &self.request_cache
    }

    pub fn content_cache(&self) -> &ObjectCache<SnapshotContent> {
        &self.content_cache
    }

    /// Registry of running backend operations.
    pub fn operations(&self) -> &OperationDeduplicator {
        &self.operations
    }

    /// Start informers and workers.  The returned handle stops them.
    pub fn start(self: &Arc<Self>) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).run_informer::<SnapshotRequest>(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).run_informer::<SnapshotContent>(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).run_informer::<VolumeClaim>(shutdown_rx)),
        ];
        for _ in 0..self.config.snapshot_workers {
            tasks.push(tokio::spawn(Arc::clone(self).run_request_worker()));
        }
        for _ in 0..self.config.content_workers {
            tasks.push(tokio::spawn(Arc::clone(self).run_content_worker()));
        }
        info!(
            snapshot_workers = self.config.snapshot_workers,
            content_workers = self.config.content_workers,
            "snapshot controller started"
        );
        ControllerHandle {
            controller: Arc::clone(self),
            shutdown_tx,
            tasks,
        }
    }

    async fn run_request_worker(self: Arc<Self>) {
        while let Some(key) = self.request_queue.get().await {
            self.process_request_key(&key).await;
            self.request_queue.done(&key);
        }
        debug!("snapshot request worker stopped");
    }

    async fn run_content_worker(self: Arc<Self>) {
        while let Some(key) = self.content_queue.get().await {
            self.process_content_key(&key).await;
            self.content_queue.done(&key);
        }
        debug!("snapshot content worker stopped");
    }

    /// Sync the request cached under `key`, requeueing with backoff on a
    /// transient failure.
    pub async fn process_request_key(self: &Arc<Self>, key: &str) {
        let Some(request) = self.request_cache.get(key) else {
            debug!(%key, "snapshot request no longer cached, skipping");
            self.request_queue.forget(key);
            return;
        };
        match self.sync_request(request).await {
            Ok(()) => self.request_queue.forget(key),
            Err(err) if err.is_retryable() => {
                debug!(%key, error = %err, "snapshot request sync failed, requeueing");
                self.request_queue.add_rate_limited(key);
            }
            Err(err) => {
                warn!(%key, error = %err, "snapshot request sync failed");
                self.request_queue.forget(key);
            }
        }
    }

    /// Sync the content cached under `key`, requeueing with backoff on a
    /// transient failure.
    pub async fn process_content_key(self: &Arc<Self>, key: &str) {
        let Some(content) = self.content_cache.get(key) else {
            debug!(%key, "snapshot content no longer cached, skipping");
            self.content_queue.forget(key);
            return;
        };
        match self.sync_content(content).await {
            Ok(()) => self.content_queue.forget(key),
            Err(err) if err.is_retryable() => {
                debug!(%key, error = %err, "snapshot content sync failed, requeueing");
                self.content_queue.add_rate_limited(key);
            }
            Err(err) => {
                warn!(%key, error = %err, "snapshot content sync failed");
                self.content_queue.forget(key);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    /// Run a backend call under the configured timeout.
    async fn call_backend<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.config.operation_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| SnapshotError::Timeout(timeout))?
    }

    fn emit<K: Resource>(&self, obj: &K, event_type: EventType, reason: &str, message: &str) {
        self.recorder.record(event(obj, event_type, reason, message));
    }

    fn cache_request(&self, request: SnapshotRequest) {
        if let Err(err) = self.request_cache.update(request) {
            warn!(error = %err, "failed to cache snapshot request");
        }
    }

    fn cache_content(&self, content: SnapshotContent) {
        if let Err(err) = self.content_cache.update(content) {
            warn!(error = %err, "failed to cache snapshot content");
        }
    }

    /// Cached request, falling back to the store on a miss.
    async fn get_request(&self, namespace: &str, name: &str) -> Result<Option<SnapshotRequest>> {
        if let Some(request) = self.request_cache.get(&object_key(Some(namespace), name)) {
            return Ok(Some(request));
        }
        let request = self.requests.get(Some(namespace), name).await?;
        if let Some(request) = &request {
            self.cache_request(request.clone());
        }
        Ok(request)
    }

    /// Cached content, falling back to the store on a miss.
    async fn get_content(&self, name: &str) -> Result<Option<SnapshotContent>> {
        if let Some(content) = self.content_cache.get(name) {
            return Ok(Some(content));
        }
        let content = self.contents.get(None, name).await?;
        if let Some(content) = &content {
            self.cache_content(content.clone());
        }
        Ok(content)
    }

    /// Newest known copy of `request`.
    fn latest_request(&self, request: &SnapshotRequest) -> SnapshotRequest {
        request
            .key()
            .ok()
            .and_then(|key| self.request_cache.get(&key))
            .filter(|cached| cached.metadata.uid == request.metadata.uid)
            .unwrap_or_else(|| request.clone())
    }

    /// Patch the request's status to the result of `mutate`.  Nothing is
    /// written when the status does not change.
    async fn update_request_status<F>(
        &self,
        request: &SnapshotRequest,
        mutate: F,
    ) -> Result<SnapshotRequest>
    where
        F: FnOnce(&mut SnapshotRequestStatus),
    {
        let mut desired = request.clone();
        mutate(desired.status.get_or_insert_with(Default::default));
        let Some(patch) = object_merge_patch(request, &desired)? else {
            return Ok(request.clone());
        };
        let updated = self
            .requests
            .patch(
                Some(request.namespace()),
                &request.metadata.name,
                &serde_json::to_vec(&patch)?,
            )
            .await?;
        self.cache_request(updated.clone());
        Ok(updated)
    }

    /// Patch the content's status to the result of `mutate`.  Nothing is
    /// written when the status does not change.
    async fn update_content_status<F>(
        &self,
        content: &SnapshotContent,
        mutate: F,
    ) -> Result<SnapshotContent>
    where
        F: FnOnce(&mut SnapshotContentStatus),
    {
        let mut desired = content.clone();
        mutate(desired.status.get_or_insert_with(Default::default));
        let Some(patch) = object_merge_patch(content, &desired)? else {
            return Ok(content.clone());
        };
        let updated = self
            .contents
            .patch(None, &content.metadata.name, &serde_json::to_vec(&patch)?)
            .await?;
        self.cache_content(updated.clone());
        Ok(updated)
    }

    /// Record `err` on the request's status and emit a warning event.  A
    /// request already carrying the same message is left untouched.
    async fn record_request_error(
        &self,
        request: &SnapshotRequest,
        err: &SnapshotError,
        reason: &str,
    ) -> Result<()> {
        let current = self.latest_request(request);
        let message = err.to_string();
        if current.error().is_some_and(|e| e.message == message) {
            return Ok(());
        }
        let retryable = err.is_retryable();
        self.update_request_status(&current, |status| {
            status.error = Some(ErrorRecord::new(message.clone(), retryable));
        })
        .await?;
        self.emit(&current, EventType::Warning, reason, &message);
        Ok(())
    }

    /// Record `err` on the content's status and emit a warning event.  A
    /// content already carrying the same message is left untouched.
    async fn record_content_error(
        &self,
        content: &SnapshotContent,
        err: &SnapshotError,
        reason: &str,
    ) -> Result<()> {
        let message = err.to_string();
        if content
            .status
            .as_ref()
            .and_then(|s| s.error.as_ref())
            .is_some_and(|e| e.message == message)
        {
            return Ok(());
        }
        let retryable = err.is_retryable();
        self.update_content_status(content, |status| {
            status.error = Some(ErrorRecord::new(message.clone(), retryable));
        })
        .await?;
        self.emit(content, EventType::Warning, reason, &message);
        Ok(())
    }
}

/// Running controller.
pub struct ControllerHandle {
    controller: Arc<SnapshotController>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    /// The running controller.
    pub fn controller(&self) -> &Arc<SnapshotController> {
        &self.controller
    }

    /// Stop informers and workers, then wait for running operations.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.controller.request_queue.shutdown();
        self.controller.content_queue.shutdown();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "controller task failed");
            }
        }
        self.controller.operations.wait_idle().await;
        info!("snapshot controller stopped");
    }
}
