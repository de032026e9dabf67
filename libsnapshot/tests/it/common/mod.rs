//! Shared harness: in-memory stores, backend and secret source wired into a
//! running controller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use libsnapshot::events::EventLog;
use libsnapshot::logging;
use libsnapshot::store::{ListParams, WatchEvent};
use libsnapshot::{
    ANN_DEFAULT_SNAPSHOT_CLASS, ClaimPhase, Collaborators, ControllerConfig, ControllerHandle,
    DeletionPolicy, MemoryBackend, MemorySecretSource, MemoryStore, ObjectMeta, ResourceStore,
    Result, SnapshotClass, SnapshotContent, SnapshotController, SnapshotError, SnapshotRequest,
    SnapshotSource, VolumeClaim, VolumeClaimSpec, VolumeClaimStatus,
};
use tokio::sync::broadcast;

pub const DRIVER: &str = "mem.csi.rk8s.io";
pub const NS: &str = "default";

/// Intervals shrunk so that retries and resyncs happen within a test.
pub fn config() -> ControllerConfig {
    ControllerConfig {
        snapshot_workers: 2,
        content_workers: 2,
        resync_period: Duration::from_millis(100),
        operation_timeout: Duration::from_secs(5),
        create_content_retry_count: 3,
        create_content_retry_interval: Duration::from_millis(10),
        queue_base_delay: Duration::from_millis(5),
        queue_max_delay: Duration::from_millis(200),
        finalizer_retry_initial: Duration::from_millis(1),
        finalizer_retry_factor: 1.5,
        finalizer_retry_deadline: Duration::from_secs(5),
        operation_backoff_initial: Duration::from_millis(10),
        operation_backoff_max: Duration::from_millis(200),
    }
}

pub struct Cluster {
    pub requests: Arc<MemoryStore<SnapshotRequest>>,
    pub contents: Arc<MemoryStore<SnapshotContent>>,
    pub classes: Arc<MemoryStore<SnapshotClass>>,
    pub claims: Arc<MemoryStore<VolumeClaim>>,
    pub backend: Arc<MemoryBackend>,
    pub secrets: Arc<MemorySecretSource>,
    pub events: Arc<EventLog>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new(DRIVER).with_size(1024))
    }

    pub fn with_backend(backend: MemoryBackend) -> Self {
        logging::try_init_for_tests();
        Self {
            requests: Arc::new(MemoryStore::new()),
            contents: Arc::new(MemoryStore::new()),
            classes: Arc::new(MemoryStore::new()),
            claims: Arc::new(MemoryStore::new()),
            backend: Arc::new(backend),
            secrets: Arc::new(MemorySecretSource::new()),
            events: Arc::new(EventLog::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            requests: self.requests.clone(),
            contents: self.contents.clone(),
            classes: self.classes.clone(),
            claims: self.claims.clone(),
            backend: self.backend.clone(),
            secrets: self.secrets.clone(),
            recorder: self.events.clone(),
        }
    }

    pub async fn start(&self) -> ControllerHandle {
        let controller = SnapshotController::new(config(), self.collaborators())
            .await
            .unwrap();
        controller.start()
    }

    /// A default class for the test driver plus a bound claim `pvc1`.
    pub async fn seed(&self, policy: DeletionPolicy) {
        self.classes
            .create(class("csi-snapclass", true, policy))
            .await
            .unwrap();
        self.claims
            .create(bound_claim("pvc1", "vol-1"))
            .await
            .unwrap();
    }

    pub fn request(&self, name: &str) -> Option<SnapshotRequest> {
        self.requests.peek(Some(NS), name)
    }

    pub fn content(&self, name: &str) -> Option<SnapshotContent> {
        self.contents.peek(None, name)
    }

    pub fn reasons(&self, request: &str) -> Vec<String> {
        self.events.reasons_for("SnapshotRequest", request)
    }

    pub fn content_reasons(&self, content: &str) -> Vec<String> {
        self.events.reasons_for("SnapshotContent", content)
    }
}

/// Content store that refuses every create and passes everything else
/// through to the wrapped store.
pub struct RejectCreates(pub Arc<MemoryStore<SnapshotContent>>);

#[async_trait]
impl ResourceStore<SnapshotContent> for RejectCreates {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<SnapshotContent>> {
        self.0.get(namespace, name).await
    }

    async fn list(&self, params: &ListParams) -> Result<Vec<SnapshotContent>> {
        self.0.list(params).await
    }

    async fn create(&self, _obj: SnapshotContent) -> Result<SnapshotContent> {
        Err(SnapshotError::internal("store is read-only"))
    }

    async fn update(&self, obj: SnapshotContent) -> Result<SnapshotContent> {
        self.0.update(obj).await
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &[u8],
    ) -> Result<SnapshotContent> {
        self.0.patch(namespace, name, patch).await
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.0.delete(namespace, name).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<SnapshotContent>> {
        self.0.watch()
    }
}

pub fn class(name: &str, default: bool, policy: DeletionPolicy) -> SnapshotClass {
    let mut metadata = ObjectMeta::cluster(name);
    if default {
        metadata
            .annotations
            .insert(ANN_DEFAULT_SNAPSHOT_CLASS.to_owned(), "true".to_owned());
    }
    SnapshotClass {
        metadata,
        driver: DRIVER.to_owned(),
        parameters: BTreeMap::new(),
        deletion_policy: policy,
    }
}

pub fn bound_claim(name: &str, volume_handle: &str) -> VolumeClaim {
    VolumeClaim {
        metadata: ObjectMeta::namespaced(NS, name),
        spec: VolumeClaimSpec::default(),
        status: Some(VolumeClaimStatus {
            phase: ClaimPhase::Bound,
            volume_handle: Some(volume_handle.to_owned()),
        }),
    }
}

/// A pending claim restored from the snapshot request `snapshot`.
pub fn restoring_claim(name: &str, snapshot: &str) -> VolumeClaim {
    VolumeClaim {
        metadata: ObjectMeta::namespaced(NS, name),
        spec: VolumeClaimSpec {
            data_source_snapshot: Some(snapshot.to_owned()),
        },
        status: None,
    }
}

pub fn claim_request(name: &str, claim: &str) -> SnapshotRequest {
    SnapshotRequest::new(
        NS,
        name,
        SnapshotSource {
            volume_claim_name: Some(claim.to_owned()),
            content_name: None,
        },
    )
}

pub fn content_request(name: &str, content: &str) -> SnapshotRequest {
    SnapshotRequest::new(
        NS,
        name,
        SnapshotSource {
            volume_claim_name: None,
            content_name: Some(content.to_owned()),
        },
    )
}

/// Poll `check` until it holds, panicking after ten seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Give the controller a few resync periods to act on something it should
/// leave alone.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(350)).await;
}
