//! Snapshot request reconciliation and dynamic snapshot creation.

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use super::SnapshotController;
use crate::backend::{CreateSnapshotRequest, SnapshotInfo};
use crate::binding::{self, ClaimDecision, RequestState};
use crate::error::{Result, SnapshotError};
use crate::events::{
    EventType, REASON_BIND_FAILED, REASON_CLASS_RESOLUTION_FAILED, REASON_CONTENT_MISSING,
    REASON_CREATE_CONTENT_FAILED, REASON_INVALID_SOURCE, REASON_SNAPSHOT_CREATED,
    REASON_SNAPSHOT_CREATION_FAILED, REASON_SNAPSHOT_LOST, REASON_SNAPSHOT_MISBOUND,
    REASON_SNAPSHOT_READY, REASON_STATUS_CHECK_FAILED,
};
use crate::finalizer::{self, Removal};
use crate::operation::create_operation_name;
use crate::secret::{SecretRef, TemplateContext, strip_reserved_parameters};
use crate::store::ListParams;
use crate::types::{
    ANN_DELETION_SECRET_NAME, ANN_DELETION_SECRET_NAMESPACE, ANN_DYNAMICALLY_PROVISIONED,
    ClaimPhase, ContentSource, FINALIZER_CONTENT_BOUND, ObjectMeta, RequestReference,
    RequestSource, Resource, SnapshotClass, SnapshotContent, SnapshotContentSpec,
    SnapshotContentStatus, SnapshotRequest, VolumeClaim, content_name_for, object_key,
    snapshot_name_for,
};

impl SnapshotController {
    /// Reconcile one snapshot request.
    #[instrument(
        skip(self, request),
        fields(snapshot = %object_key(Some(request.namespace()), &request.metadata.name))
    )]
    pub async fn sync_request(self: &Arc<Self>, request: SnapshotRequest) -> Result<()> {
        let mut request = request;
        let missing = finalizer::missing_finalizers(&request);
        if !missing.is_empty() {
            request = finalizer::add_finalizers(self.requests.as_ref(), &request, &missing).await?;
            self.cache_request(request.clone());
        }

        let content = match request.target_content_name() {
            Some(name) => self.get_content(name).await?,
            None => None,
        };

        let state = binding::classify(&request, content.as_ref());
        match state {
            RequestState::Deleting => self.process_request_deletion(&request).await,
            RequestState::Fresh => self.sync_fresh_request(&request).await,
            RequestState::AwaitingContent => {
                let name = request.target_content_name().unwrap_or_default();
                let err = SnapshotError::not_found(SnapshotContent::KIND, name);
                self.record_request_error(&request, &err, REASON_CONTENT_MISSING)
                    .await
            }
            RequestState::Binding => match content {
                Some(content) => self.bind_and_refresh(&request, content).await,
                None => Ok(()),
            },
            RequestState::Ready => {
                debug!("snapshot request is bound and ready");
                Ok(())
            }
            RequestState::Misbound => {
                let err = SnapshotError::Misbound(format!(
                    "snapshot content {} is not bound to this snapshot request",
                    request.bound_content_name().unwrap_or_default()
                ));
                self.record_request_error(&request, &err, REASON_SNAPSHOT_MISBOUND)
                    .await
            }
            RequestState::Lost => {
                let err = SnapshotError::Misbound(format!(
                    "bound snapshot content {} has been deleted",
                    request.bound_content_name().unwrap_or_default()
                ));
                self.record_request_error(&request, &err, REASON_SNAPSHOT_LOST)
                    .await
            }
        }
    }

    /// Whether a claim in the request's namespace is being restored from it.
    async fn is_request_in_use(&self, request: &SnapshotRequest) -> Result<bool> {
        let claims = self
            .claims
            .list(&ListParams::namespace(request.namespace()))
            .await?;
        Ok(claims.iter().any(|claim| {
            claim.phase() == ClaimPhase::Pending
                && claim.spec.data_source_snapshot.as_deref()
                    == Some(request.metadata.name.as_str())
        }))
    }

    async fn process_request_deletion(self: &Arc<Self>, request: &SnapshotRequest) -> Result<()> {
        if !finalizer::is_deletion_candidate(request) {
            return Ok(());
        }
        let outcome = finalizer::remove_protection(
            self.requests.as_ref(),
            Some(request.namespace()),
            &request.metadata.name,
            self.config.finalizer_retry(),
            |current| async move { self.is_request_in_use(&current).await },
        )
        .await?;

        match outcome {
            Removal::InUse => {
                info!("snapshot request is a restore source, deferring deletion");
            }
            Removal::Removed(Some(stored)) => self.cache_request(stored),
            Removal::Removed(None) | Removal::Gone => {
                self.request_cache.delete(&request.key()?);
                self.operations.forget(&create_operation_name(
                    request.namespace(),
                    &request.metadata.name,
                    &request.metadata.uid,
                ));
                if let Some(content) = request.bound_content_name() {
                    self.content_queue.add(content);
                }
            }
        }
        Ok(())
    }

    async fn sync_fresh_request(self: &Arc<Self>, request: &SnapshotRequest) -> Result<()> {
        if let Err(err) = request.spec.source.resolve() {
            return self
                .record_request_error(request, &err, REASON_INVALID_SOURCE)
                .await;
        }

        let contents = self.content_cache.list();
        if let Some(content) = binding::find_matching_content(request, &contents) {
            info!(content = %content.metadata.name, "found existing content for snapshot request");
            self.update_request_status(request, |status| {
                status.bound_content_name = Some(content.metadata.name.clone());
            })
            .await?;
            return Ok(());
        }

        if let Some(err) = request.error()
            && !err.retryable
        {
            debug!(error = %err.message, "snapshot request has a final error, not creating");
            return Ok(());
        }

        self.schedule_create(request)
    }

    fn schedule_create(self: &Arc<Self>, request: &SnapshotRequest) -> Result<()> {
        let key = request.key()?;
        let name = create_operation_name(
            request.namespace(),
            &request.metadata.name,
            &request.metadata.uid,
        );
        let this = Arc::clone(self);
        let owned = request.clone();
        match self
            .operations
            .run(&name, async move { this.create_snapshot_operation(owned).await })
        {
            Ok(_) => Ok(()),
            Err(SnapshotError::OperationInFlight(_)) => {
                debug!(operation = %name, "snapshot creation already in flight");
                Ok(())
            }
            Err(SnapshotError::OperationBackoff { remaining, .. }) => {
                debug!(operation = %name, ?remaining, "snapshot creation backing off");
                self.request_queue.add_after(&key, remaining);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn create_snapshot_operation(self: Arc<Self>, request: SnapshotRequest) -> Result<()> {
        let key = request.key()?;
        let Err(err) = self.create_snapshot(&request).await else {
            self.request_queue.forget(&key);
            return Ok(());
        };

        let reason = match err {
            SnapshotError::ClassNotFound(_)
            | SnapshotError::NoDefaultClass(_)
            | SnapshotError::AmbiguousDefaultClass { .. } => REASON_CLASS_RESOLUTION_FAILED,
            _ => REASON_SNAPSHOT_CREATION_FAILED,
        };
        if let Err(record_err) = self.record_request_error(&request, &err, reason).await {
            warn!(%key, error = %record_err, "failed to record snapshot creation error");
        }
        if err.is_retryable() {
            self.request_queue.add_rate_limited(&key);
        }
        Err(err)
    }

    /// Cut a backend snapshot for `request`, persist its content and bind
    /// the request to it.
    #[instrument(
        skip(self, request),
        fields(snapshot = %request.metadata.name, uid = %request.metadata.uid)
    )]
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        let RequestSource::VolumeClaim(claim_name) = request.spec.source.resolve()? else {
            return Ok(());
        };
        let class = self
            .classes
            .resolve(request.spec.snapshot_class_name.as_deref(), &self.driver)
            .await?;
        if class.driver != self.driver {
            debug!(
                class = %class.metadata.name,
                driver = %class.driver,
                "class belongs to another driver"
            );
            return Ok(());
        }

        let namespace = request.namespace();
        let claim: VolumeClaim = self
            .claims
            .get(Some(namespace), claim_name)
            .await?
            .ok_or_else(|| {
                SnapshotError::not_found(VolumeClaim::KIND, object_key(Some(namespace), claim_name))
            })?;
        let volume_handle = claim
            .volume_handle()
            .ok_or_else(|| {
                SnapshotError::SourceNotReady(format!(
                    "volume claim {namespace}/{claim_name} is not bound to a volume"
                ))
            })?
            .to_owned();

        let uid = &request.metadata.uid;
        let content_name = content_name_for(uid);
        let ctx = TemplateContext {
            content_name: content_name.clone(),
            request_name: Some(request.metadata.name.clone()),
            request_namespace: Some(namespace.to_owned()),
        };
        let (secret_ref, secrets) = self.secrets.resolve(&class.parameters, &ctx).await?;

        let info = self
            .call_backend(self.backend.create_snapshot(CreateSnapshotRequest {
                source_volume_handle: volume_handle.clone(),
                name: snapshot_name_for(uid),
                parameters: strip_reserved_parameters(&class.parameters),
                secrets,
            }))
            .await?;
        info!(handle = %info.handle, ready = info.ready, "backend snapshot created");

        let desired = self.new_content(
            request,
            &class,
            &content_name,
            volume_handle,
            &info,
            secret_ref.as_ref(),
        );
        let content = match self.persist_content(desired.clone()).await {
            Ok(content) => content,
            Err(err) => {
                error!(
                    handle = %info.handle,
                    content = %content_name,
                    error = %err,
                    "backend snapshot has no content object and must be cleaned up manually"
                );
                let err = SnapshotError::Internal(format!(
                    "failed to save snapshot content {content_name} for backend snapshot {}: {err}",
                    info.handle
                ));
                self.record_request_error(request, &err, REASON_CREATE_CONTENT_FAILED)
                    .await?;
                return Err(err);
            }
        };
        if let Some(status) = desired.status {
            self.update_content_status(&content, |s| *s = status).await?;
        }

        let latest = self.latest_request(request);
        self.update_request_status(&latest, |status| {
            status.bound_content_name = Some(content_name.clone());
            status.ready_to_use = Some(info.ready);
            status.creation_time = Some(info.created_at);
            status.restore_size = Some(info.size_bytes);
            status.error = None;
        })
        .await?;
        self.emit(
            request,
            EventType::Normal,
            REASON_SNAPSHOT_CREATED,
            &format!(
                "created snapshot content {content_name} for backend snapshot {}",
                info.handle
            ),
        );
        Ok(())
    }

    fn new_content(
        &self,
        request: &SnapshotRequest,
        class: &SnapshotClass,
        content_name: &str,
        volume_handle: String,
        info: &SnapshotInfo,
        secret_ref: Option<&SecretRef>,
    ) -> SnapshotContent {
        let mut metadata = ObjectMeta::cluster(content_name);
        metadata
            .annotations
            .insert(ANN_DYNAMICALLY_PROVISIONED.to_owned(), self.driver.clone());
        if let Some(secret) = secret_ref {
            metadata
                .annotations
                .insert(ANN_DELETION_SECRET_NAME.to_owned(), secret.name.clone());
            metadata.annotations.insert(
                ANN_DELETION_SECRET_NAMESPACE.to_owned(),
                secret.namespace.clone(),
            );
        }
        metadata.add_finalizer(FINALIZER_CONTENT_BOUND);

        SnapshotContent {
            metadata,
            spec: SnapshotContentSpec {
                request_ref: Some(RequestReference {
                    name: request.metadata.name.clone(),
                    namespace: request.namespace().to_owned(),
                    uid: request.metadata.uid.clone(),
                }),
                source: ContentSource {
                    volume_handle: Some(volume_handle),
                    snapshot_handle: None,
                },
                deletion_policy: Some(class.deletion_policy),
                snapshot_class_name: Some(class.metadata.name.clone()),
                driver: self.driver.clone(),
            },
            status: Some(SnapshotContentStatus {
                snapshot_handle: Some(info.handle.clone()),
                ready_to_use: Some(info.ready),
                creation_time: Some(info.created_at),
                restore_size: Some(info.size_bytes),
                error: None,
            }),
        }
    }

    /// Create `content`, retrying per configuration.  A content that already
    /// exists under the same name counts as created.
    async fn persist_content(&self, content: SnapshotContent) -> Result<SnapshotContent> {
        let attempts = self.config.create_content_retry_count.max(1);
        let name = content.metadata.name.clone();
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.contents.create(content.clone()).await {
                Ok(created) => {
                    self.cache_content(created.clone());
                    return Ok(created);
                }
                Err(SnapshotError::AlreadyExists { .. }) => {
                    if let Some(existing) = self.contents.get(None, &name).await? {
                        debug!(content = %name, "snapshot content already exists");
                        self.cache_content(existing.clone());
                        return Ok(existing);
                    }
                }
                Err(err) => {
                    warn!(
                        content = %name,
                        attempt,
                        error = %err,
                        "failed to save snapshot content"
                    );
                    last_err = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.create_content_retry_interval).await;
            }
        }
        Err(last_err.unwrap_or_else(|| SnapshotError::internal("snapshot content was not saved")))
    }

    /// Bind `request` to the content it names, then copy the backend status
    /// onto both objects.
    async fn bind_and_refresh(
        &self,
        request: &SnapshotRequest,
        content: SnapshotContent,
    ) -> Result<()> {
        if content.spec.driver != self.driver {
            debug!(content = %content.metadata.name, "content belongs to another driver");
            return Ok(());
        }

        let content = match binding::check_content_claim(request, &content) {
            ClaimDecision::AlreadyBound => content,
            ClaimDecision::Claim => {
                let mut claimed = content;
                if let Some(r) = claimed.spec.request_ref.as_mut() {
                    r.uid = request.metadata.uid.clone();
                }
                if claimed.spec.snapshot_class_name.is_none() {
                    claimed.spec.snapshot_class_name = request.spec.snapshot_class_name.clone();
                }
                let claimed = self.contents.update(claimed).await?;
                info!(content = %claimed.metadata.name, "claimed pre-provisioned snapshot content");
                self.cache_content(claimed.clone());
                claimed
            }
            ClaimDecision::Mismatch(message) => {
                let err = SnapshotError::Misbound(message);
                return self
                    .record_request_error(request, &err, REASON_BIND_FAILED)
                    .await;
            }
        };

        self.refresh_status(request, &content).await
    }

    async fn refresh_status(
        &self,
        request: &SnapshotRequest,
        content: &SnapshotContent,
    ) -> Result<()> {
        let Some(handle) = content.snapshot_handle() else {
            debug!(content = %content.metadata.name, "content has no snapshot handle yet");
            return Ok(());
        };

        let (ready, creation_time, restore_size) = if self.status_supported {
            let info = match self
                .call_backend(self.backend.get_snapshot_status(handle))
                .await
            {
                Ok(info) => info,
                Err(err) => {
                    self.record_request_error(request, &err, REASON_STATUS_CHECK_FAILED)
                        .await?;
                    return Err(err);
                }
            };
            let handle = handle.to_owned();
            self.update_content_status(content, |status| {
                status.snapshot_handle = Some(handle);
                status.ready_to_use = Some(info.ready);
                status.creation_time = Some(info.created_at);
                status.restore_size = Some(info.size_bytes);
                status.error = None;
            })
            .await?;
            (info.ready, Some(info.created_at), Some(info.size_bytes))
        } else {
            let status = content.status.clone().unwrap_or_default();
            (
                status.ready_to_use.unwrap_or(false),
                status.creation_time,
                status.restore_size,
            )
        };

        let latest = self.latest_request(request);
        let was_ready = latest.is_ready();
        self.update_request_status(&latest, |status| {
            status.bound_content_name = Some(content.metadata.name.clone());
            status.ready_to_use = Some(ready);
            if creation_time.is_some() {
                status.creation_time = creation_time;
            }
            if restore_size.is_some() {
                status.restore_size = restore_size;
            }
            status.error = None;
        })
        .await?;
        if ready && !was_ready {
            self.emit(
                request,
                EventType::Normal,
                REASON_SNAPSHOT_READY,
                &format!("snapshot {} is ready to use", request.metadata.name),
            );
        }
        Ok(())
    }
}
