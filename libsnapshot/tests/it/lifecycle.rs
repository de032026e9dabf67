//! Dynamic provisioning: create, bind, become ready, delete.

use std::collections::BTreeMap;
use std::sync::Arc;

use libsnapshot::backend::BackendCapability;
use libsnapshot::events::{
    REASON_CREATE_CONTENT_FAILED, REASON_SNAPSHOT_CREATED, REASON_SNAPSHOT_CREATION_FAILED,
    REASON_SNAPSHOT_READY,
};
use libsnapshot::secret::{PARAM_SECRET_NAME, PARAM_SECRET_NAMESPACE};
use libsnapshot::{
    ANN_DELETION_SECRET_NAME, ANN_DELETION_SECRET_NAMESPACE, ANN_DYNAMICALLY_PROVISIONED,
    ContentSource, DeletionPolicy, FINALIZER_CONTENT_BOUND, FINALIZER_REQUEST_AS_SOURCE,
    FINALIZER_REQUEST_BOUND, MemoryBackend, ObjectMeta, RequestReference, ResourceStore,
    SnapshotContent, SnapshotContentSpec, SnapshotController, SnapshotError, content_name_for,
};

use crate::common::{Cluster, NS, RejectCreates, claim_request, class, config, eventually, settle};

#[tokio::test(flavor = "multi_thread")]
async fn dynamic_snapshot_lifecycle() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Delete).await;
    let handle = cluster.start().await;

    let created = cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    let content_name = content_name_for(&created.metadata.uid);

    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    eventually("request protected", || {
        cluster.request("snap1").is_some_and(|r| {
            r.metadata.has_finalizer(FINALIZER_REQUEST_AS_SOURCE)
                && r.metadata.has_finalizer(FINALIZER_REQUEST_BOUND)
        })
    })
    .await;

    let request = cluster.request("snap1").unwrap();
    let status = request.status.clone().unwrap();
    assert_eq!(status.bound_content_name.as_deref(), Some(content_name.as_str()));
    assert_eq!(status.restore_size, Some(1024));
    assert!(status.creation_time.is_some());
    assert!(status.error.is_none());

    let content = cluster.content(&content_name).unwrap();
    let reference = content.spec.request_ref.clone().unwrap();
    assert_eq!(reference.uid, created.metadata.uid);
    assert_eq!(reference.namespace, NS);
    assert_eq!(content.spec.driver, crate::common::DRIVER);
    assert_eq!(content.spec.source.volume_handle.as_deref(), Some("vol-1"));
    assert_eq!(content.spec.snapshot_class_name.as_deref(), Some("csi-snapclass"));
    assert_eq!(content.deletion_policy(), Some(DeletionPolicy::Delete));
    assert!(content.is_dynamically_provisioned());
    assert_eq!(
        content.metadata.annotation(ANN_DYNAMICALLY_PROVISIONED),
        Some(crate::common::DRIVER)
    );
    assert!(content.metadata.has_finalizer(FINALIZER_CONTENT_BOUND));
    let snapshot_handle = content.snapshot_handle().unwrap().to_owned();
    assert!(cluster.backend.contains(&snapshot_handle));
    assert_eq!(cluster.backend.len(), 1);
    assert!(cluster.reasons("snap1").iter().any(|r| r == REASON_SNAPSHOT_CREATED));

    cluster.requests.delete(Some(NS), "snap1").await.unwrap();
    eventually("request removed", || cluster.request("snap1").is_none()).await;
    eventually("content removed", || cluster.content(&content_name).is_none()).await;
    assert!(!cluster.backend.contains(&snapshot_handle));
    assert!(cluster.backend.delete_calls() >= 1);
    eventually("operations forgotten", || {
        handle.controller().operations().tracked() == 0
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn readiness_follows_backend() {
    let cluster = Cluster::with_backend(
        MemoryBackend::new(crate::common::DRIVER).with_ready_on_create(false),
    );
    cluster.seed(DeletionPolicy::Delete).await;
    let handle = cluster.start().await;

    let created = cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    let content_name = content_name_for(&created.metadata.uid);

    eventually("request bound", || {
        cluster
            .request("snap1")
            .is_some_and(|r| r.bound_content_name() == Some(content_name.as_str()))
    })
    .await;
    let request = cluster.request("snap1").unwrap();
    assert!(!request.is_ready());

    let snapshot_handle = cluster
        .content(&content_name)
        .and_then(|c| c.snapshot_handle().map(str::to_owned))
        .unwrap();
    cluster.backend.set_ready(&snapshot_handle, true);

    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    eventually("content ready", || {
        cluster.content(&content_name).is_some_and(|c| c.is_ready())
    })
    .await;
    assert!(cluster.reasons("snap1").iter().any(|r| r == REASON_SNAPSHOT_READY));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_syncs_cut_one_snapshot() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Delete).await;
    let gate = cluster.backend.gate_creates();
    let handle = cluster.start().await;
    let controller = handle.controller().clone();

    cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    eventually("backend create started", || cluster.backend.create_calls() == 1).await;

    let request = cluster.request("snap1").unwrap();
    assert!(request.metadata.has_finalizer(FINALIZER_REQUEST_AS_SOURCE));
    for _ in 0..5 {
        controller.sync_request(request.clone()).await.unwrap();
    }
    controller.resync().await;
    assert_eq!(controller.operations().in_flight(), 1);
    assert_eq!(cluster.backend.create_calls(), 1);

    gate.add_permits(16);
    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    assert_eq!(cluster.backend.len(), 1);
    assert_eq!(cluster.contents.len(), 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_backend_failure_is_retried() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Delete).await;
    cluster
        .backend
        .fail_next_create(SnapshotError::backend_retryable("backend unavailable"));
    let handle = cluster.start().await;

    cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();

    eventually("request ready", || {
        cluster
            .request("snap1")
            .is_some_and(|r| r.is_ready() && r.error().is_none())
    })
    .await;
    assert!(cluster.backend.create_calls() >= 2);
    assert_eq!(cluster.backend.len(), 1);
    assert!(
        cluster
            .reasons("snap1")
            .iter()
            .any(|r| r == REASON_SNAPSHOT_CREATION_FAILED)
    );
    eventually("failure history cleared", || {
        handle.controller().operations().tracked() == 0
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unbound_source_claim_is_retried_once_bound() {
    let cluster = Cluster::new();
    cluster
        .classes
        .create(class("csi-snapclass", true, DeletionPolicy::Delete))
        .await
        .unwrap();
    let mut pending = crate::common::bound_claim("pvc1", "vol-1");
    pending.status = None;
    cluster.claims.create(pending).await.unwrap();
    let handle = cluster.start().await;

    cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    eventually("source error recorded", || {
        cluster
            .request("snap1")
            .and_then(|r| r.error().cloned())
            .is_some_and(|e| e.retryable && e.message.contains("not bound"))
    })
    .await;
    assert_eq!(cluster.backend.len(), 0);

    cluster
        .claims
        .patch(
            Some(NS),
            "pvc1",
            br#"{"status":{"phase":"Bound","volumeHandle":"vol-1"}}"#,
        )
        .await
        .unwrap();
    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_secret_is_recorded_on_content() {
    let cluster = Cluster::new();
    let mut with_secret = class("csi-snapclass", true, DeletionPolicy::Delete);
    with_secret
        .parameters
        .insert(PARAM_SECRET_NAME.to_owned(), "snap-secret".to_owned());
    with_secret.parameters.insert(
        PARAM_SECRET_NAMESPACE.to_owned(),
        "${volumesnapshot.namespace}".to_owned(),
    );
    with_secret
        .parameters
        .insert("tier".to_owned(), "gold".to_owned());
    cluster.classes.create(with_secret).await.unwrap();
    cluster
        .claims
        .create(crate::common::bound_claim("pvc1", "vol-1"))
        .await
        .unwrap();
    cluster.secrets.insert(
        NS,
        "snap-secret",
        BTreeMap::from([("token".to_owned(), "s3cr3t".to_owned())]),
    );
    let handle = cluster.start().await;

    let created = cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    let content_name = content_name_for(&created.metadata.uid);

    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    let content = cluster.content(&content_name).unwrap();
    assert_eq!(
        content.metadata.annotation(ANN_DELETION_SECRET_NAME),
        Some("snap-secret")
    );
    assert_eq!(
        content.metadata.annotation(ANN_DELETION_SECRET_NAMESPACE),
        Some(NS)
    );

    cluster.requests.delete(Some(NS), "snap1").await.unwrap();
    eventually("content removed", || cluster.content(&content_name).is_none()).await;
    assert!(cluster.backend.is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn startup_requires_create_delete_capability() {
    let cluster = Cluster::with_backend(
        MemoryBackend::new(crate::common::DRIVER)
            .with_capabilities(&[BackendCapability::GetSnapshotStatus]),
    );
    let result = SnapshotController::new(config(), cluster.collaborators()).await;
    assert!(matches!(result, Err(SnapshotError::InvalidArgument(_))));
}

#[tokio::test]
async fn startup_rejects_invalid_config() {
    let cluster = Cluster::new();
    let mut bad = config();
    bad.snapshot_workers = 0;
    let result = SnapshotController::new(bad, cluster.collaborators()).await;
    assert!(matches!(result, Err(SnapshotError::InvalidArgument(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_content_under_generated_name_is_adopted() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Delete).await;

    let mut request = claim_request("snap1", "pvc1");
    request.metadata.uid = "3f1c".into();
    request.spec.snapshot_class_name = Some("csi-snapclass".into());
    let content_name = content_name_for("3f1c");
    // Same generated name, but a class the request does not ask for, so the
    // pre-creation search passes it over.
    cluster
        .contents
        .create(SnapshotContent {
            metadata: ObjectMeta::cluster(&content_name),
            spec: SnapshotContentSpec {
                request_ref: Some(RequestReference {
                    name: "snap1".into(),
                    namespace: NS.into(),
                    uid: "3f1c".into(),
                }),
                source: ContentSource {
                    volume_handle: Some("vol-1".into()),
                    snapshot_handle: None,
                },
                deletion_policy: Some(DeletionPolicy::Delete),
                snapshot_class_name: Some("other".into()),
                driver: crate::common::DRIVER.into(),
            },
            status: None,
        })
        .await
        .unwrap();
    cluster.requests.create(request).await.unwrap();
    let handle = cluster.start().await;

    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    assert_eq!(cluster.contents.len(), 1);
    assert_eq!(
        cluster.request("snap1").unwrap().bound_content_name(),
        Some(content_name.as_str())
    );
    let snapshot_handle = cluster
        .content(&content_name)
        .and_then(|c| c.snapshot_handle().map(str::to_owned))
        .unwrap();
    assert!(cluster.backend.contains(&snapshot_handle));
    assert_eq!(cluster.backend.len(), 1);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsaved_content_leaves_a_final_error() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Delete).await;
    let mut collaborators = cluster.collaborators();
    collaborators.contents = Arc::new(RejectCreates(cluster.contents.clone()));
    let handle = SnapshotController::new(config(), collaborators)
        .await
        .unwrap()
        .start();

    let created = cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    let content_name = content_name_for(&created.metadata.uid);

    eventually("content failure recorded", || {
        cluster
            .reasons("snap1")
            .iter()
            .any(|r| r == REASON_CREATE_CONTENT_FAILED)
    })
    .await;
    let error = cluster.request("snap1").unwrap().error().cloned().unwrap();
    assert!(!error.retryable);
    assert!(error.message.contains(&content_name));
    assert!(error.message.contains("backend snapshot snap-"));

    // The backend snapshot is left for an operator; nothing retries it.
    settle().await;
    assert_eq!(cluster.backend.len(), 1);
    assert!(cluster.contents.is_empty());
    assert!(!cluster.request("snap1").unwrap().is_ready());

    handle.shutdown().await;
}
