//! In-memory snapshot backend.
//!
//! [`MemoryBackend`] keeps snapshots in concurrent maps and exposes knobs for
//! driving the controller through its edge cases: readiness can be flipped
//! per handle, failures can be injected, and gates can hold `create_snapshot`
//! or `delete_snapshot` open to exercise concurrent reconciliation.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use super::{BackendCapability, CreateSnapshotRequest, Secrets, SnapshotBackend, SnapshotInfo};
use crate::error::SnapshotError;

/// Process-local backend.
pub struct MemoryBackend {
    driver: String,
    capabilities: HashSet<BackendCapability>,
    /// Snapshots keyed by handle.
    snapshots: DashMap<String, SnapshotInfo>,
    /// Maps the caller-supplied snapshot name to its handle, so repeated
    /// creates for the same name return the same snapshot.
    names: DashMap<String, String>,
    /// Size reported for every new snapshot.
    default_size: u64,
    /// Whether new snapshots are immediately ready.
    ready_on_create: bool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    /// Errors returned by upcoming `create_snapshot` calls, in order.
    create_failures: Mutex<VecDeque<SnapshotError>>,
    /// When set, `create_snapshot` waits for a permit before proceeding.
    create_gate: Mutex<Option<Arc<Semaphore>>>,
    /// When set, `delete_snapshot` waits for a permit before proceeding.
    delete_gate: Mutex<Option<Arc<Semaphore>>>,
}

/// Wait for a permit if `gate` is set.
async fn pass(gate: &Mutex<Option<Arc<Semaphore>>>) -> Result<(), SnapshotError> {
    let gate = gate.lock().clone();
    if let Some(gate) = gate {
        let permit = gate
            .acquire()
            .await
            .map_err(SnapshotError::backend_retryable)?;
        permit.forget();
    }
    Ok(())
}

impl MemoryBackend {
    /// A backend for `driver` supporting create, delete and status checks.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            capabilities: HashSet::from([
                BackendCapability::CreateDeleteSnapshot,
                BackendCapability::GetSnapshotStatus,
            ]),
            snapshots: DashMap::new(),
            names: DashMap::new(),
            default_size: 0,
            ready_on_create: true,
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            create_failures: Mutex::new(VecDeque::new()),
            create_gate: Mutex::new(None),
            delete_gate: Mutex::new(None),
        }
    }

    /// Report `size_bytes` for every new snapshot.
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.default_size = size_bytes;
        self
    }

    /// Whether new snapshots start out ready.
    pub fn with_ready_on_create(mut self, ready: bool) -> Self {
        self.ready_on_create = ready;
        self
    }

    /// Replace the advertised capabilities.
    pub fn with_capabilities(mut self, capabilities: &[BackendCapability]) -> Self {
        self.capabilities = capabilities.iter().copied().collect();
        self
    }

    /// Hold every subsequent `create_snapshot` until the returned semaphore
    /// receives permits.
    pub fn gate_creates(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.create_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Hold every subsequent `delete_snapshot` until the returned semaphore
    /// receives permits.
    pub fn gate_deletes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.delete_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Queue an error for the next `create_snapshot` call.
    pub fn fail_next_create(&self, err: SnapshotError) {
        self.create_failures.lock().push_back(err);
    }

    /// Mark a snapshot as ready.
    pub fn set_ready(&self, handle: &str, ready: bool) {
        if let Some(mut info) = self.snapshots.get_mut(handle) {
            info.ready = ready;
        }
    }

    /// Number of `create_snapshot` calls so far.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete_snapshot` calls so far.
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Whether a snapshot with `handle` exists.
    pub fn contains(&self, handle: &str) -> bool {
        self.snapshots.contains_key(handle)
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no snapshot is stored.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl SnapshotBackend for MemoryBackend {
    async fn get_driver_name(&self) -> Result<String, SnapshotError> {
        Ok(self.driver.clone())
    }

    async fn supports(&self, capability: BackendCapability) -> Result<bool, SnapshotError> {
        Ok(self.capabilities.contains(&capability))
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_handle))]
    async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<SnapshotInfo, SnapshotError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.create_gate).await?;

        if let Some(err) = self.create_failures.lock().pop_front() {
            return Err(err);
        }
        if req.source_volume_handle.is_empty() {
            return Err(SnapshotError::InvalidArgument(
                "source volume handle is empty".into(),
            ));
        }

        let existing = self.names.get(&req.name).map(|r| r.clone());
        if let Some(handle) = existing
            && let Some(info) = self.snapshots.get(&handle).map(|r| r.clone())
        {
            debug!(%handle, "returning existing snapshot for idempotent create");
            return Ok(info);
        }

        let handle = format!("snap-{}", uuid::Uuid::new_v4());
        let info = SnapshotInfo {
            handle: handle.clone(),
            created_at: Utc::now(),
            size_bytes: self.default_size,
            ready: self.ready_on_create,
        };
        self.snapshots.insert(handle.clone(), info.clone());
        self.names.insert(req.name, handle.clone());

        info!(%handle, "snapshot created");
        Ok(info)
    }

    #[instrument(skip(self, _secrets))]
    async fn delete_snapshot(&self, handle: &str, _secrets: &Secrets) -> Result<(), SnapshotError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.delete_gate).await?;
        if self.snapshots.remove(handle).is_some() {
            self.names.retain(|_, h| h.as_str() != handle);
            info!(%handle, "snapshot deleted");
        } else {
            debug!(%handle, "snapshot already gone");
        }
        Ok(())
    }

    async fn get_snapshot_status(&self, handle: &str) -> Result<SnapshotInfo, SnapshotError> {
        self.snapshots
            .get(handle)
            .map(|r| r.clone())
            .ok_or_else(|| SnapshotError::not_found("Snapshot", handle))
    }
}
