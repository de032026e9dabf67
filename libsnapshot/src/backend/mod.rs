//! Pluggable snapshot backend.
//!
//! [`SnapshotBackend`] is the controller's only view of the storage system.
//! The RPC transport behind it is out of scope for this crate; the
//! [`memory`] module provides a process-local implementation.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

pub use memory::MemoryBackend;

/// Resolved credentials handed to the backend.
pub type Secrets = BTreeMap<String, String>;

/// Capabilities a backend may advertise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendCapability {
    /// `create_snapshot` and `delete_snapshot` are implemented.
    CreateDeleteSnapshot,
    /// `get_snapshot_status` is implemented.
    GetSnapshotStatus,
}

/// Request to cut a snapshot of a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Backend handle of the volume to snapshot.
    pub source_volume_handle: String,
    /// Deterministic snapshot name; backends use it for idempotency.
    pub name: String,
    /// Class parameters with controller-reserved keys stripped.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub secrets: Secrets,
}

/// Snapshot facts reported by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub handle: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub ready: bool,
}

/// Creates, deletes and inspects backend snapshots.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Name of the driver; only contents and classes naming this driver are
    /// reconciled.
    async fn get_driver_name(&self) -> Result<String, SnapshotError>;

    /// Capability discovery.
    async fn supports(&self, capability: BackendCapability) -> Result<bool, SnapshotError>;

    /// Cut a snapshot.
    ///
    /// Must be idempotent on `req.name`: a repeated call for a snapshot that
    /// already exists returns the existing snapshot.
    async fn create_snapshot(&self, req: CreateSnapshotRequest)
    -> Result<SnapshotInfo, SnapshotError>;

    /// Delete a snapshot.  Deleting an unknown handle succeeds.
    async fn delete_snapshot(&self, handle: &str, secrets: &Secrets) -> Result<(), SnapshotError>;

    /// Current readiness, creation time and size of a snapshot.
    async fn get_snapshot_status(&self, handle: &str) -> Result<SnapshotInfo, SnapshotError>;
}
