//! Core object model: snapshot requests, snapshot contents, classes and
//! volume claims.
//!
//! The shapes mirror the Kubernetes snapshot API closely enough that objects
//! round-trip through JSON merge patches field by field.  All types are
//! [`Serialize`]/[`Deserialize`] with camel-case field names.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapshotError};

// ---------------------------------------------------------------------------
// Well-known names
// ---------------------------------------------------------------------------

/// Annotation marking a class as the default for its driver.
pub const ANN_DEFAULT_SNAPSHOT_CLASS: &str = "snapshot.storage.kubernetes.io/is-default-class";

/// Annotation set on a content once the controller decided to delete it.
pub const ANN_BEING_DELETED: &str = "snapshot.storage.kubernetes.io/volumesnapshot-being-deleted";

/// Annotation set on contents the controller provisioned itself.
pub const ANN_DYNAMICALLY_PROVISIONED: &str =
    "snapshot.storage.kubernetes.io/dynamically-provisioned";

/// Name of the secret used when deleting the backend snapshot.
pub const ANN_DELETION_SECRET_NAME: &str = "snapshot.storage.kubernetes.io/deletion-secret-name";

/// Namespace of the secret used when deleting the backend snapshot.
pub const ANN_DELETION_SECRET_NAMESPACE: &str =
    "snapshot.storage.kubernetes.io/deletion-secret-namespace";

/// Blocks deletion of a request while a claim is being restored from it.
pub const FINALIZER_REQUEST_AS_SOURCE: &str =
    "snapshot.storage.kubernetes.io/volumesnapshot-as-source-protection";

/// Blocks deletion of a request while it is bound to a content.
pub const FINALIZER_REQUEST_BOUND: &str =
    "snapshot.storage.kubernetes.io/volumesnapshot-bound-protection";

/// Blocks deletion of a request that belongs to a group snapshot.
pub const FINALIZER_REQUEST_IN_GROUP: &str =
    "snapshot.storage.kubernetes.io/volumesnapshot-in-group-protection";

/// Blocks deletion of a content while a live request is bound to it.
pub const FINALIZER_CONTENT_BOUND: &str =
    "snapshot.storage.kubernetes.io/volumesnapshotcontent-bound-protection";

/// Prefix of dynamically provisioned content names.
pub const CONTENT_NAME_PREFIX: &str = "snapcontent-";

/// Prefix of snapshot names handed to the backend.
pub const SNAPSHOT_NAME_PREFIX: &str = "snapshot-";

/// Deterministic content name for a request UID.
pub fn content_name_for(uid: &str) -> String {
    format!("{CONTENT_NAME_PREFIX}{uid}")
}

/// Deterministic backend snapshot name for a request UID.
pub fn snapshot_name_for(uid: &str) -> String {
    format!("{SNAPSHOT_NAME_PREFIX}{uid}")
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Metadata common to every stored object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name, unique within its namespace (or cluster for
    /// cluster-scoped kinds).
    #[serde(default)]
    pub name: String,
    /// Namespace for namespaced kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Immutable identity assigned by the store on creation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Opaque, monotonically increasing version token.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    /// Set by the store when the object was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set by the store when deletion was requested while finalizers remain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Protection markers.  `None` when no finalizer is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Metadata for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Cache key: `namespace/name` or `name`.
    pub fn key(&self) -> Result<String> {
        if self.name.is_empty() {
            return Err(SnapshotError::MissingKey);
        }
        Ok(object_key(self.namespace.as_deref(), &self.name))
    }

    /// Deletion was requested.
    pub fn is_being_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether `finalizer` is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|x| x == finalizer))
    }

    /// Append `finalizer` if absent.  Returns `true` when the list changed.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_owned());
        true
    }

    /// Drop `finalizer` if present.  An emptied list is normalized to `None`.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(list) = self.finalizers.as_mut() else {
            return false;
        };
        let before = list.len();
        list.retain(|f| f != finalizer);
        let changed = list.len() != before;
        if list.is_empty() {
            self.finalizers = None;
        }
        changed
    }

    /// Value of annotation `key`.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Build a cache key from an optional namespace and a name.
pub fn object_key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_owned(),
    }
}

/// A kind of stored object.
pub trait Resource:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Kind name used in logs, events and errors.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> Result<String> {
        self.meta().key()
    }
}

/// Reference to a stored object, used when recording events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl ObjectReference {
    /// Reference to `obj`.
    pub fn to<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            kind: K::KIND.to_owned(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
        }
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.kind,
            object_key(self.namespace.as_deref(), &self.name)
        )
    }
}

// ---------------------------------------------------------------------------
// Shared status pieces
// ---------------------------------------------------------------------------

/// Last error observed while reconciling an object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub time: DateTime<Utc>,
    pub message: String,
    /// Transient errors do not block a later retry of dynamic creation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl ErrorRecord {
    /// An error stamped with the current time.
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            time: Utc::now(),
            message: message.into(),
            retryable,
        }
    }
}

/// What happens to the backend snapshot when its request goes away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Retain,
}

// ---------------------------------------------------------------------------
// SnapshotRequest
// ---------------------------------------------------------------------------

/// User intent to snapshot a claim or to consume an existing content.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub metadata: ObjectMeta,
    pub spec: SnapshotRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SnapshotRequestStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequestSpec {
    pub source: SnapshotSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class_name: Option<String>,
}

/// Where the snapshot comes from.  Exactly one field must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    /// Claim to snapshot (dynamic provisioning).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_name: Option<String>,
    /// Pre-provisioned content to bind to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_name: Option<String>,
}

/// Validated view of a [`SnapshotSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource<'a> {
    VolumeClaim(&'a str),
    PreProvisioned(&'a str),
}

impl SnapshotSource {
    /// Validate that exactly one non-empty source is set.
    pub fn resolve(&self) -> Result<RequestSource<'_>> {
        match (
            self.volume_claim_name.as_deref().filter(|s| !s.is_empty()),
            self.content_name.as_deref().filter(|s| !s.is_empty()),
        ) {
            (Some(claim), None) => Ok(RequestSource::VolumeClaim(claim)),
            (None, Some(content)) => Ok(RequestSource::PreProvisioned(content)),
            (Some(_), Some(_)) => Err(SnapshotError::InvalidArgument(
                "only one of volumeClaimName and contentName may be set".into(),
            )),
            (None, None) => Err(SnapshotError::InvalidArgument(
                "exactly one of volumeClaimName and contentName must be set".into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group_snapshot_name: Option<String>,
}

impl SnapshotRequest {
    /// A request for `source` with no class and no status.
    pub fn new(namespace: &str, name: &str, source: SnapshotSource) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: SnapshotRequestSpec {
                source,
                snapshot_class_name: None,
            },
            status: None,
        }
    }

    /// Namespace of the request, empty when unset.
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Whether the status reports the snapshot ready to use.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Content named in the status, if any.
    pub fn bound_content_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.bound_content_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Content this request points at: the bound name, else the
    /// pre-provisioned source.
    pub fn target_content_name(&self) -> Option<&str> {
        self.bound_content_name()
            .or(self.spec.source.content_name.as_deref())
            .filter(|s| !s.is_empty())
    }

    /// Last error recorded on the status.
    pub fn error(&self) -> Option<&ErrorRecord> {
        self.status.as_ref().and_then(|s| s.error.as_ref())
    }

    /// Group snapshot this request belongs to.
    pub fn group_snapshot_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.volume_group_snapshot_name.as_deref())
    }
}

impl Resource for SnapshotRequest {
    const KIND: &'static str = "SnapshotRequest";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ---------------------------------------------------------------------------
// SnapshotContent
// ---------------------------------------------------------------------------

/// Backend-facing record of a snapshot handle.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotContent {
    pub metadata: ObjectMeta,
    pub spec: SnapshotContentSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SnapshotContentStatus>,
}

/// Back-reference from a content to the request it binds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestReference {
    pub name: String,
    pub namespace: String,
    /// Empty while pre-bound and not yet claimed.
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotContentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_ref: Option<RequestReference>,
    pub source: ContentSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class_name: Option<String>,
    pub driver: String,
}

/// Exactly one of a volume to snapshot or an existing backend snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContentSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotContentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl SnapshotContent {
    /// Backend handle: the recorded status handle, else the pre-provisioned
    /// source handle.
    pub fn snapshot_handle(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.snapshot_handle.as_deref())
            .or(self.spec.source.snapshot_handle.as_deref())
            .filter(|h| !h.is_empty())
    }

    /// Whether the status reports the snapshot ready to use.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Created by the controller rather than an operator.
    pub fn is_dynamically_provisioned(&self) -> bool {
        self.metadata.annotations.contains_key(ANN_DYNAMICALLY_PROVISIONED)
    }

    /// What happens to the backend snapshot on deletion.
    pub fn deletion_policy(&self) -> Option<DeletionPolicy> {
        self.spec.deletion_policy
    }
}

impl Resource for SnapshotContent {
    const KIND: &'static str = "SnapshotContent";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ---------------------------------------------------------------------------
// SnapshotClass
// ---------------------------------------------------------------------------

/// Cluster-scoped policy object carrying backend parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotClass {
    pub metadata: ObjectMeta,
    pub driver: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

impl Resource for SnapshotClass {
    const KIND: &'static str = "SnapshotClass";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

// ---------------------------------------------------------------------------
// VolumeClaim
// ---------------------------------------------------------------------------

/// A volume claim: either the source of a snapshot or a restore target.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaim {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VolumeClaimSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeClaimStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimSpec {
    /// Name of the snapshot request this claim is restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_snapshot: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Lost,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimStatus {
    pub phase: ClaimPhase,
    /// Backend handle of the bound volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_handle: Option<String>,
}

impl VolumeClaim {
    /// Phase from the status, `Pending` when unset.
    pub fn phase(&self) -> ClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Handle of the bound volume, if bound.
    pub fn volume_handle(&self) -> Option<&str> {
        self.status
            .as_ref()
            .filter(|s| s.phase == ClaimPhase::Bound)
            .and_then(|s| s.volume_handle.as_deref())
    }
}

impl Resource for VolumeClaim {
    const KIND: &'static str = "VolumeClaim";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
