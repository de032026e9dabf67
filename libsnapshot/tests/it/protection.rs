//! Deletion protection and retention.

use libsnapshot::backend::{CreateSnapshotRequest, SnapshotBackend};
use libsnapshot::{
    ANN_BEING_DELETED, ANN_DYNAMICALLY_PROVISIONED, ContentSource, DeletionPolicy,
    FINALIZER_CONTENT_BOUND, ObjectMeta, RequestReference, ResourceStore, SnapshotContent,
    SnapshotContentSpec, SnapshotContentStatus, content_name_for,
};

use crate::common::{Cluster, DRIVER, NS, claim_request, eventually, restoring_claim, settle};

#[tokio::test(flavor = "multi_thread")]
async fn restore_source_blocks_request_deletion() {
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

    cluster
        .claims
        .create(restoring_claim("restored", "snap1"))
        .await
        .unwrap();
    cluster.requests.delete(Some(NS), "snap1").await.unwrap();

    settle().await;
    let pending = cluster.request("snap1").unwrap();
    assert!(pending.metadata.is_being_deleted());
    assert!(cluster.content(&content_name).is_some());
    assert_eq!(cluster.backend.len(), 1);

    cluster
        .claims
        .patch(Some(NS), "restored", br#"{"status":{"phase":"Bound"}}"#)
        .await
        .unwrap();
    eventually("request removed", || cluster.request("snap1").is_none()).await;
    eventually("content removed", || cluster.content(&content_name).is_none()).await;
    assert!(cluster.backend.is_empty());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retain_policy_keeps_content_and_snapshot() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Retain).await;
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

    cluster.requests.delete(Some(NS), "snap1").await.unwrap();
    eventually("request removed", || cluster.request("snap1").is_none()).await;
    settle().await;

    let content = cluster.content(&content_name).unwrap();
    assert!(!content.metadata.is_being_deleted());
    assert!(content.metadata.annotation(ANN_BEING_DELETED).is_none());
    assert_eq!(content.deletion_policy(), Some(DeletionPolicy::Retain));
    assert_eq!(cluster.backend.len(), 1);
    assert_eq!(cluster.backend.delete_calls(), 0);

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bound_content_survives_direct_deletion() {
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

    cluster.contents.delete(None, &content_name).await.unwrap();
    settle().await;
    let content = cluster.content(&content_name).unwrap();
    assert!(content.metadata.is_being_deleted());
    assert_eq!(cluster.backend.len(), 1);
    assert!(cluster.request("snap1").unwrap().is_ready());

    // Dropping the request lets the pending deletion finish.
    cluster.requests.delete(Some(NS), "snap1").await.unwrap();
    eventually("content removed", || cluster.content(&content_name).is_none()).await;
    assert!(cluster.backend.is_empty());

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn content_of_a_recreated_request_is_deleted() {
    let cluster = Cluster::new();
    cluster.seed(DeletionPolicy::Delete).await;
    let stale_snapshot = cluster
        .backend
        .create_snapshot(CreateSnapshotRequest {
            source_volume_handle: "vol-1".into(),
            name: "snapshot-old-uid".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Content left behind by an earlier request of the same name.
    let stale_name = content_name_for("old-uid");
    let mut metadata = ObjectMeta::cluster(&stale_name);
    metadata
        .annotations
        .insert(ANN_DYNAMICALLY_PROVISIONED.to_owned(), DRIVER.to_owned());
    metadata.add_finalizer(FINALIZER_CONTENT_BOUND);
    cluster
        .contents
        .create(SnapshotContent {
            metadata,
            spec: SnapshotContentSpec {
                request_ref: Some(RequestReference {
                    name: "snap1".into(),
                    namespace: NS.into(),
                    uid: "old-uid".into(),
                }),
                source: ContentSource {
                    volume_handle: Some("vol-1".into()),
                    snapshot_handle: None,
                },
                deletion_policy: Some(DeletionPolicy::Delete),
                snapshot_class_name: Some("csi-snapclass".into()),
                driver: DRIVER.into(),
            },
            status: Some(SnapshotContentStatus {
                snapshot_handle: Some(stale_snapshot.handle.clone()),
                ready_to_use: Some(true),
                ..Default::default()
            }),
        })
        .await
        .unwrap();
    let created = cluster
        .requests
        .create(claim_request("snap1", "pvc1"))
        .await
        .unwrap();
    let deletes = cluster.backend.gate_deletes();
    let handle = cluster.start().await;

    eventually("stale content marked", || {
        cluster.content(&stale_name).is_some_and(|c| {
            c.metadata.annotation(ANN_BEING_DELETED).is_some() && c.metadata.is_being_deleted()
        })
    })
    .await;
    eventually("request ready", || {
        cluster.request("snap1").is_some_and(|r| r.is_ready())
    })
    .await;
    let fresh_name = content_name_for(&created.metadata.uid);
    assert_eq!(
        cluster.request("snap1").unwrap().bound_content_name(),
        Some(fresh_name.as_str())
    );
    assert!(cluster.backend.contains(&stale_snapshot.handle));

    deletes.add_permits(16);
    eventually("stale content removed", || cluster.content(&stale_name).is_none()).await;
    assert!(!cluster.backend.contains(&stale_snapshot.handle));
    assert!(cluster.content(&fresh_name).is_some());
    assert_eq!(cluster.backend.len(), 1);

    handle.shutdown().await;
}
