//! # libsnapshot: volume snapshot controller for RK8s
//!
//! `libsnapshot` binds user-facing [`SnapshotRequest`]s to backend-facing
//! [`SnapshotContent`]s.  It cuts snapshots through a pluggable
//! [`SnapshotBackend`], keeps both halves of every binding consistent, and
//! protects in-use objects from deletion with finalizers.  It follows the
//! RK8s conventions (Tokio async runtime, `tracing` for observability,
//! `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Object model: requests, contents, classes, claims, metadata. |
//! | [`error`] | [`SnapshotError`] enum covering all failure modes. |
//! | [`config`] | [`ControllerConfig`]: workers, resync, timeouts, retries. |
//! | [`logging`] | `tracing-subscriber` setup. |
//! | [`store`] | [`ResourceStore`] trait and the in-memory store. |
//! | [`backend`] | [`SnapshotBackend`] trait and the in-memory backend. |
//! | [`cache`] | [`ObjectCache`]: resource-version-aware mirror of the store. |
//! | [`backoff`] | Capped exponential delays. |
//! | [`queue`] | [`WorkQueue`]: de-duplicating, rate-limited key queue. |
//! | [`operation`] | [`OperationDeduplicator`]: single-flight named operations. |
//! | [`patch`] | Minimal JSON merge patches. |
//! | [`binding`] | Request/content binding rules. |
//! | [`finalizer`] | Deletion protection. |
//! | [`class`] | Snapshot class and default-class resolution. |
//! | [`secret`] | Snapshotter secret templates and lookup. |
//! | [`events`] | User-visible events. |
//! | [`controller`] | [`SnapshotController`]: the reconciler. |

pub mod backend;
pub mod backoff;
pub mod binding;
pub mod cache;
pub mod class;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod logging;
pub mod operation;
pub mod patch;
pub mod queue;
pub mod secret;
pub mod store;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::{MemoryBackend, SnapshotBackend};
pub use cache::ObjectCache;
pub use config::ControllerConfig;
pub use controller::{Collaborators, ControllerHandle, SnapshotController};
pub use error::{Result, SnapshotError};
pub use events::{EventLog, EventRecorder};
pub use operation::OperationDeduplicator;
pub use queue::WorkQueue;
pub use secret::{MemorySecretSource, SecretSource};
pub use store::{MemoryStore, ResourceStore};
pub use types::*;
