//! Named, single-flight background operations.
//!
//! Slow backend calls (cutting or deleting a snapshot) run on their own
//! tokio task so a worker never blocks on them.  [`OperationDeduplicator`]
//! guarantees at most one running operation per name and, after a failure,
//! refuses to start the same name again until its exponential backoff has
//! elapsed.  A failed name is forgotten once it has sat idle for the maximum
//! backoff past its own window, or when its object is gone.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::ExponentialBackoff;
use crate::error::{Result, SnapshotError};

/// Name of the operation creating the snapshot for a request.
pub fn create_operation_name(namespace: &str, name: &str, uid: &str) -> String {
    format!("create-{namespace}/{name}[{uid}]")
}

/// Name of the operation deleting the backend snapshot of a content.
pub fn delete_operation_name(name: &str, uid: &str) -> String {
    format!("delete-{name}[{uid}]")
}

#[derive(Debug, Default)]
struct OperationState {
    running: bool,
    last_failure: Option<Instant>,
    backoff: Duration,
}

#[derive(Default)]
struct Shared {
    operations: Mutex<HashMap<String, OperationState>>,
    idle: Notify,
}

impl Shared {
    fn running(&self) -> usize {
        self.operations.lock().values().filter(|s| s.running).count()
    }
}

impl OperationState {
    /// Whether the entry still carries information worth keeping.
    fn is_live(&self, grace: Duration) -> bool {
        self.running
            || self
                .last_failure
                .is_some_and(|failed_at| failed_at.elapsed() < self.backoff + grace)
    }
}

/// Single-flight executor keyed by operation name.
#[derive(Clone)]
pub struct OperationDeduplicator {
    shared: Arc<Shared>,
    backoff: ExponentialBackoff,
}

impl OperationDeduplicator {
    /// Failed operations back off from `initial_backoff`, doubling up to
    /// `max_backoff`.
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            backoff: ExponentialBackoff::new(initial_backoff, 2.0, max_backoff),
        }
    }

    /// Start `op` under `name`.
    ///
    /// Fails with [`SnapshotError::OperationInFlight`] while an operation of
    /// the same name runs, and with [`SnapshotError::OperationBackoff`] while
    /// the previous failure of that name is backing off.  The returned handle
    /// yields the operation's own result; dropping it does not cancel the
    /// operation.
    pub fn run<F>(&self, name: &str, op: F) -> Result<JoinHandle<Result<()>>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        {
            let mut operations = self.shared.operations.lock();
            let grace = self.backoff.max;
            operations.retain(|key, state| key == name || state.is_live(grace));
            let state = operations.entry(name.to_owned()).or_default();
            if state.running {
                return Err(SnapshotError::OperationInFlight(name.to_owned()));
            }
            if let Some(failed_at) = state.last_failure {
                let elapsed = failed_at.elapsed();
                if elapsed < state.backoff {
                    return Err(SnapshotError::OperationBackoff {
                        name: name.to_owned(),
                        remaining: state.backoff - elapsed,
                    });
                }
            }
            state.running = true;
        }

        debug!(operation = name, "operation started");
        let shared = Arc::clone(&self.shared);
        let backoff = self.backoff;
        let name = name.to_owned();
        Ok(tokio::spawn(async move {
            let result = match AssertUnwindSafe(op).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(SnapshotError::internal(format!(
                    "operation {name} panicked"
                ))),
            };
            Self::finish(&shared, &backoff, &name, &result);
            result
        }))
    }

    fn finish(shared: &Shared, backoff: &ExponentialBackoff, name: &str, result: &Result<()>) {
        {
            let mut operations = shared.operations.lock();
            match result {
                Ok(()) => {
                    operations.remove(name);
                    debug!(operation = name, "operation succeeded");
                }
                Err(err) => {
                    let state = operations.entry(name.to_owned()).or_default();
                    state.running = false;
                    state.last_failure = Some(Instant::now());
                    state.backoff = backoff.next_after(state.backoff);
                    warn!(
                        operation = name,
                        error = %err,
                        backoff = ?state.backoff,
                        "operation failed"
                    );
                }
            }
        }
        shared.idle.notify_waiters();
    }

    /// Drop the failure history of `name` unless it is running.
    pub fn forget(&self, name: &str) {
        let mut operations = self.shared.operations.lock();
        if operations.get(name).is_some_and(|s| !s.running) {
            operations.remove(name);
            debug!(operation = name, "operation forgotten");
        }
    }

    /// Whether an operation named `name` is running.
    pub fn is_running(&self, name: &str) -> bool {
        self.shared
            .operations
            .lock()
            .get(name)
            .is_some_and(|s| s.running)
    }

    /// Number of running operations.
    pub fn in_flight(&self) -> usize {
        self.shared.running()
    }

    /// Number of names that are running or still remember a failure.
    pub fn tracked(&self) -> usize {
        self.shared.operations.lock().len()
    }

    /// Wait until no operation is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.running() == 0 {
                return;
            }
            notified.await;
        }
    }
}
