//! Rate-limited, de-duplicating work queue.
//!
//! Keys move through three sets:
//!
//! * `queue`: waiting to be handed to a worker, in FIFO order.
//! * `dirty`: needs processing. A key that is already dirty is not queued
//!   twice.
//! * `processing`: currently held by a worker. A key re-added while it is
//!   processing is only marked dirty, and goes back on the queue when the
//!   worker calls [`WorkQueue::done`].
//!
//! A key is therefore never handed to two workers at the same time.
//! Failed keys are re-added through [`WorkQueue::add_rate_limited`], which
//! applies a per-key exponential delay until [`WorkQueue::forget`] is called.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::backoff::ExponentialBackoff;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

/// Work queue keyed by `namespace/name` strings.
pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    /// Failure count per key, for rate limiting.
    failures: Mutex<HashMap<String, u32>>,
    backoff: ExponentialBackoff,
    notify: Notify,
}

impl WorkQueue {
    /// Create a queue whose per-key retry delay doubles from `base_delay`
    /// up to `max_delay`.
    pub fn new(name: &'static str, base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            failures: Mutex::new(HashMap::new()),
            backoff: ExponentialBackoff::new(base_delay, 2.0, max_delay),
            notify: Notify::new(),
        })
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_owned());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_owned());
        drop(state);
        trace!(queue = self.name, key, "queued");
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Re-add `key` after its current backoff delay and grow that delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut failures = self.failures.lock();
            let count = failures.entry(key.to_owned()).or_insert(0);
            let attempt = *count;
            *count = count.saturating_add(1);
            attempt
        };
        let delay = self.backoff.delay(attempt);
        trace!(queue = self.name, key, ?delay, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Number of rate-limited re-adds since the last [`forget`](Self::forget).
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key.  Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing.  If it was re-added in the meantime
    /// it goes back on the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker.  Keys already
    /// queued are still handed out.
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
