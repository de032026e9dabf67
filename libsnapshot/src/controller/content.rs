//! Snapshot content reconciliation and backend snapshot deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::SnapshotController;
use crate::backend::Secrets;
use crate::binding;
use crate::error::{Result, SnapshotError};
use crate::events::{
    EventType, REASON_CONTENT_ORPHANED, REASON_SNAPSHOT_DELETED, REASON_SNAPSHOT_DELETE_FAILED,
};
use crate::finalizer::{self, Removal};
use crate::operation::delete_operation_name;
use crate::secret::SecretRef;
use crate::types::{
    ANN_BEING_DELETED, ANN_DELETION_SECRET_NAME, ANN_DELETION_SECRET_NAMESPACE,
    DeletionPolicy, FINALIZER_CONTENT_BOUND, SnapshotContent,
};

impl SnapshotController {
    /// Reconcile one snapshot content.
    #[instrument(skip(self, content), fields(content = %content.metadata.name))]
    pub async fn sync_content(self: &Arc<Self>, content: SnapshotContent) -> Result<()> {
        if content.spec.driver != self.driver {
            debug!(driver = %content.spec.driver, "content belongs to another driver");
            return Ok(());
        }

        if finalizer::is_deletion_candidate(&content) {
            return self.process_content_deletion(&content).await;
        }
        if content.metadata.is_being_deleted() {
            return Ok(());
        }

        if finalizer::needs_finalizer(&content) {
            let updated = finalizer::add_finalizers(
                self.contents.as_ref(),
                &content,
                &[FINALIZER_CONTENT_BOUND],
            )
            .await?;
            self.cache_content(updated);
            return Ok(());
        }

        let Some(reference) = content.spec.request_ref.clone() else {
            let err = SnapshotError::InvalidArgument(format!(
                "snapshot content {} does not reference a snapshot request",
                content.metadata.name
            ));
            self.record_content_error(&content, &err, REASON_CONTENT_ORPHANED)
                .await?;
            return Err(err);
        };
        if reference.uid.is_empty() {
            debug!("pre-bound content waits for its snapshot request");
            return Ok(());
        }

        let request = self
            .get_request(&reference.namespace, &reference.name)
            .await?;
        if request
            .as_ref()
            .is_some_and(|r| binding::refers_to(&content, r))
        {
            return Ok(());
        }

        // The referenced request is gone, or was recreated under a new UID.
        if !content.is_dynamically_provisioned()
            || content.deletion_policy() != Some(DeletionPolicy::Delete)
        {
            debug!("snapshot request gone, retaining content");
            return Ok(());
        }
        if content.metadata.annotation(ANN_BEING_DELETED).is_none() {
            return self.mark_being_deleted(&content).await;
        }
        info!("snapshot request gone, deleting content");
        match self.contents.delete(None, &content.metadata.name).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn mark_being_deleted(&self, content: &SnapshotContent) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { ANN_BEING_DELETED: "yes" } } });
        let updated = self
            .contents
            .patch(None, &content.metadata.name, &serde_json::to_vec(&patch)?)
            .await?;
        debug!("content marked for deletion");
        self.cache_content(updated);
        Ok(())
    }

    /// Whether a request is correctly bound to `content`.
    async fn is_content_in_use(&self, content: &SnapshotContent) -> Result<bool> {
        let Some(reference) = content.spec.request_ref.as_ref() else {
            return Ok(false);
        };
        if reference.uid.is_empty() {
            return Ok(false);
        }
        let request = self
            .get_request(&reference.namespace, &reference.name)
            .await?;
        Ok(request.is_some_and(|r| binding::is_bound(&r, content)))
    }

    async fn process_content_deletion(self: &Arc<Self>, content: &SnapshotContent) -> Result<()> {
        if self.is_content_in_use(content).await? {
            debug!("content is still bound to a snapshot request, deferring deletion");
            return Ok(());
        }
        if content.deletion_policy() == Some(DeletionPolicy::Delete)
            && content.snapshot_handle().is_some()
        {
            return self.schedule_delete(content);
        }
        self.release_content(content).await
    }

    /// Strip the content's finalizer unless it became used again.
    async fn release_content(&self, content: &SnapshotContent) -> Result<()> {
        let outcome = finalizer::remove_protection(
            self.contents.as_ref(),
            None,
            &content.metadata.name,
            self.config.finalizer_retry(),
            |current| async move { self.is_content_in_use(&current).await },
        )
        .await?;
        match outcome {
            Removal::Removed(Some(stored)) => self.cache_content(stored),
            Removal::Removed(None) | Removal::Gone => {
                self.content_cache.delete(&content.metadata.name);
                self.operations.forget(&delete_operation_name(
                    &content.metadata.name,
                    &content.metadata.uid,
                ));
            }
            Removal::InUse => debug!("content became bound again, keeping finalizer"),
        }
        Ok(())
    }

    fn schedule_delete(self: &Arc<Self>, content: &SnapshotContent) -> Result<()> {
        let key = content.metadata.name.clone();
        let name = delete_operation_name(&content.metadata.name, &content.metadata.uid);
        let this = Arc::clone(self);
        let owned = content.clone();
        match self
            .operations
            .run(&name, async move { this.delete_snapshot_operation(owned).await })
        {
            Ok(_) => Ok(()),
            Err(SnapshotError::OperationInFlight(_)) => {
                debug!(operation = %name, "snapshot deletion already in flight");
                Ok(())
            }
            Err(SnapshotError::OperationBackoff { remaining, .. }) => {
                debug!(operation = %name, ?remaining, "snapshot deletion backing off");
                self.content_queue.add_after(&key, remaining);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn delete_snapshot_operation(self: Arc<Self>, content: SnapshotContent) -> Result<()> {
        let key = content.metadata.name.clone();
        let Err(err) = self.delete_snapshot(&content).await else {
            self.content_queue.forget(&key);
            return Ok(());
        };

        if let Some(current) = self.content_cache.get(&key)
            && let Err(record_err) = self
                .record_content_error(&current, &err, REASON_SNAPSHOT_DELETE_FAILED)
                .await
        {
            warn!(content = %key, error = %record_err, "failed to record snapshot deletion error");
        }
        if err.is_retryable() {
            self.content_queue.add_rate_limited(&key);
        }
        Err(err)
    }

    /// Delete the backend snapshot of `content`, then release the content.
    #[instrument(skip(self, content), fields(content = %content.metadata.name))]
    async fn delete_snapshot(&self, content: &SnapshotContent) -> Result<()> {
        if let Some(handle) = content.snapshot_handle() {
            let secrets = self.deletion_secrets(content).await?;
            self.call_backend(self.backend.delete_snapshot(handle, &secrets))
                .await?;
            info!(%handle, "backend snapshot deleted");
            self.emit(
                content,
                EventType::Normal,
                REASON_SNAPSHOT_DELETED,
                &format!("deleted backend snapshot {handle}"),
            );
        }
        self.release_content(content).await
    }

    /// Secrets recorded on the content at creation time.
    async fn deletion_secrets(&self, content: &SnapshotContent) -> Result<Secrets> {
        let annotations: &BTreeMap<String, String> = &content.metadata.annotations;
        match (
            annotations.get(ANN_DELETION_SECRET_NAME),
            annotations.get(ANN_DELETION_SECRET_NAMESPACE),
        ) {
            (Some(name), Some(namespace)) => {
                self.secrets
                    .fetch(&SecretRef {
                        namespace: namespace.clone(),
                        name: name.clone(),
                    })
                    .await
            }
            _ => Ok(Secrets::new()),
        }
    }
}
