//! Pre-provisioned binding and broken-binding reporting.

use libsnapshot::backend::{CreateSnapshotRequest, SnapshotBackend};
use libsnapshot::events::{
    REASON_BIND_FAILED, REASON_CLASS_RESOLUTION_FAILED, REASON_CONTENT_ORPHANED,
    REASON_SNAPSHOT_LOST, REASON_SNAPSHOT_MISBOUND,
};
use libsnapshot::{
    ContentSource, DeletionPolicy, FINALIZER_CONTENT_BOUND, ObjectMeta, RequestReference,
    ResourceStore, SnapshotContent, SnapshotContentSpec, SnapshotRequestStatus,
};

use crate::common::{
    Cluster, DRIVER, NS, bound_claim, claim_request, class, content_request, eventually, settle,
};

fn pre_provisioned(name: &str, request: &str, uid: &str, handle: &str) -> SnapshotContent {
    SnapshotContent {
        metadata: ObjectMeta::cluster(name),
        spec: SnapshotContentSpec {
            request_ref: Some(RequestReference {
                name: request.to_owned(),
                namespace: NS.to_owned(),
                uid: uid.to_owned(),
            }),
            source: ContentSource {
                volume_handle: None,
                snapshot_handle: Some(handle.to_owned()),
            },
            deletion_policy: Some(DeletionPolicy::Retain),
            snapshot_class_name: None,
            driver: DRIVER.to_owned(),
        },
        status: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn pre_provisioned_content_is_claimed() {
    let cluster = Cluster::new();
    let imported = cluster
        .backend
        .create_snapshot(CreateSnapshotRequest {
            source_volume_handle: "vol-9".into(),
            name: "imported".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    cluster
        .contents
        .create(pre_provisioned("imported-content", "snap-pre", "", &imported.handle))
        .await
        .unwrap();
    let handle = cluster.start().await;

    let created = cluster
        .requests
        .create(content_request("snap-pre", "imported-content"))
        .await
        .unwrap();

    eventually("request ready", || {
        cluster.request("snap-pre").is_some_and(|r| r.is_ready())
    })
    .await;
    let content = cluster.content("imported-content").unwrap();
    assert_eq!(content.spec.request_ref.unwrap().uid, created.metadata.uid);
    assert_eq!(
        content.status.and_then(|s| s.snapshot_handle),
        Some(imported.handle.clone())
    );
    let request = cluster.request("snap-pre").unwrap();
    assert_eq!(request.bound_content_name(), Some("imported-content"));
    assert_eq!(cluster.backend.create_calls(), 1);

    // Retained, and never provisioned by the controller: survives the request.
    cluster.requests.delete(Some(NS), "snap-pre").await.unwrap();
    eventually("request removed", || cluster.request("snap-pre").is_none()).await;
    settle().await;
    assert!(cluster.content("imported-content").is_some());
    assert!(cluster.backend.contains(&imported.handle));
    assert_eq!(cluster.backend.delete_calls(), 0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn content_bound_elsewhere_is_not_stolen() {
    let cluster = Cluster::new();
    let imported = cluster
        .backend
        .create_snapshot(CreateSnapshotRequest {
            source_volume_handle: "vol-9".into(),
            name: "imported".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    cluster
        .contents
        .create(pre_provisioned("taken", "snap-x", "some-other-uid", &imported.handle))
        .await
        .unwrap();
    let handle = cluster.start().await;

    cluster
        .requests
        .create(content_request("snap-x", "taken"))
        .await
        .unwrap();

    eventually("bind failure recorded", || {
        cluster.reasons("snap-x").iter().any(|r| r == REASON_BIND_FAILED)
    })
    .await;
    let request = cluster.request("snap-x").unwrap();
    let error = request.error().unwrap();
    assert!(!error.retryable);
    assert!(!request.is_ready());
    assert_eq!(
        cluster.content("taken").unwrap().spec.request_ref.unwrap().uid,
        "some-other-uid"
    );

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_bound_content_is_reported_lost() {
    let cluster = Cluster::new();
    let handle = cluster.start().await;

    let mut request = claim_request("snap1", "pvc1");
    request.status = Some(SnapshotRequestStatus {
        bound_content_name: Some("snapcontent-gone".into()),
        ready_to_use: Some(true),
        ..Default::default()
    });
    cluster.requests.create(request).await.unwrap();

    eventually("lost content reported", || {
        cluster.reasons("snap1").iter().any(|r| r == REASON_SNAPSHOT_LOST)
    })
    .await;
    let error = cluster.request("snap1").unwrap().error().cloned().unwrap();
    assert!(error.message.contains("snapcontent-gone"));
    assert!(!error.retryable);
    assert_eq!(cluster.backend.create_calls(), 0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ambiguous_default_class_is_a_final_error() {
    let cluster = Cluster::new();
    for name in ["gold", "silver"] {
        cluster
            .classes
            .create(class(name, true, DeletionPolicy::Delete))
            .await
            .unwrap();
    }
    cluster
        .claims
        .create(bound_claim("pvc1", "vol-1"))
        .await
        .unwrap();
    let handle = cluster.start().await;

    cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();

    eventually("class error recorded", || {
        cluster.request("snap1").and_then(|r| r.error().cloned()).is_some()
    })
    .await;
    let error = cluster.request("snap1").unwrap().error().cloned().unwrap();
    assert!(!error.retryable);
    assert!(
        cluster
            .reasons("snap1")
            .iter()
            .any(|r| r == REASON_CLASS_RESOLUTION_FAILED)
    );

    settle().await;
    assert_eq!(cluster.backend.create_calls(), 0);
    assert!(cluster.contents.is_empty());
    assert_eq!(
        cluster.request("snap1").unwrap().error().cloned().unwrap().time,
        error.time
    );

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_class_skips_default_resolution() {
    let cluster = Cluster::new();
    for name in ["gold", "silver"] {
        cluster
            .classes
            .create(class(name, true, DeletionPolicy::Delete))
            .await
            .unwrap();
    }
    cluster
        .claims
        .create(bound_claim("pvc1", "vol-1"))
        .await
        .unwrap();
    let handle = cluster.start().await;

    let mut request = claim_request("snap1", "pvc1");
    request.spec.snapshot_class_name = Some("silver".into());
    let created = cluster.requests.create(request).await.unwrap();

    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    let content = cluster
        .content(&libsnapshot::content_name_for(&created.metadata.uid))
        .unwrap();
    assert_eq!(content.spec.snapshot_class_name.as_deref(), Some("silver"));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn content_without_reference_is_orphaned() {
    let cluster = Cluster::new();
    let handle = cluster.start().await;

    let mut stray = pre_provisioned("stray", "unused", "", "snap-stray");
    stray.spec.request_ref = None;
    cluster.contents.create(stray).await.unwrap();

    eventually("orphan reported", || {
        cluster
            .content_reasons("stray")
            .iter()
            .any(|r| r == REASON_CONTENT_ORPHANED)
    })
    .await;
    let content = cluster.content("stray").unwrap();
    assert!(content.metadata.has_finalizer(FINALIZER_CONTENT_BOUND));
    let error = content.status.and_then(|s| s.error).unwrap();
    assert!(!error.retryable);
    assert!(error.message.contains("does not reference a snapshot request"));

    // Resyncs see the same error and stay quiet.
    settle().await;
    assert_eq!(cluster.content_reasons("stray").len(), 1);
    assert!(cluster.content("stray").is_some());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_request_pointing_at_foreign_content_is_misbound() {
    let cluster = Cluster::new();
    cluster
        .contents
        .create(pre_provisioned("c-x", "snap1", "other-uid", "snap-x"))
        .await
        .unwrap();
    let handle = cluster.start().await;

    let mut request = claim_request("snap1", "pvc1");
    request.status = Some(SnapshotRequestStatus {
        bound_content_name: Some("c-x".into()),
        ready_to_use: Some(true),
        ..Default::default()
    });
    cluster.requests.create(request).await.unwrap();

    eventually("misbinding reported", || {
        cluster
            .reasons("snap1")
            .iter()
            .any(|r| r == REASON_SNAPSHOT_MISBOUND)
    })
    .await;
    let error = cluster.request("snap1").unwrap().error().cloned().unwrap();
    assert!(!error.retryable);
    assert!(error.message.contains("c-x"));

    let content = cluster.content("c-x").unwrap();
    assert_eq!(content.spec.request_ref.unwrap().uid, "other-uid");
    assert!(!content.metadata.is_being_deleted());
    assert_eq!(cluster.backend.create_calls(), 0);

    handle.shutdown().await;
}
