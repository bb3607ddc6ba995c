//! Rate-limited work queue
//!
//! The queue feeding the reconciler's workers. Semantics:
//!
//! - Keys are unique: adding a key already waiting coalesces to one entry.
//! - A key being processed is not handed to a second worker; re-adding it
//!   marks it dirty and it re-enters the queue when the holder calls
//!   [`WorkQueue::done`].
//! - [`WorkQueue::add_rate_limited`] delays re-entry on a per-key
//!   exponential schedule and counts requeues so callers can bound retries;
//!   [`WorkQueue::forget`] resets the count.
//! - Shutdown halts all pulls: blocked and future [`WorkQueue::get`] calls
//!   return `None` so workers can drain their in-flight item and exit.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

/// Base delay of the per-key backoff schedule
const BASE_DELAY: Duration = Duration::from_millis(5);

/// Ceiling of the per-key backoff schedule
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Unique-key work queue with per-key requeue accounting
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutdown: bool,
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    /// Add a key for processing.
    ///
    /// No-op if the key is already waiting; if the key is currently being
    /// processed it is re-queued when the holder finishes.
    pub fn add(&self, key: &str) {
        let mut inner = self.inner.lock().expect("work queue poisoned");
        if inner.shutdown {
            return;
        }
        if inner.processing.contains(key) {
            inner.dirty.insert(key.to_string());
            return;
        }
        if inner.queued.insert(key.to_string()) {
            inner.pending.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Re-add a key after a failure, delayed by the per-key backoff schedule
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let attempt = {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            if inner.shutdown {
                return;
            }
            let count = inner.requeues.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let queue = Arc::clone(self);
        let key = key.to_string();
        let delay = backoff(attempt);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Pull the next key, waiting until one is available.
    ///
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("work queue poisoned");
                if inner.shutdown {
                    return None;
                }
                if let Some(key) = inner.pending.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.pending.is_empty() {
                        // keep sibling workers awake
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Signal that processing of a key finished; re-queues it if it went
    /// dirty while held.
    pub fn done(&self, key: &str) {
        let mut inner = self.inner.lock().expect("work queue poisoned");
        inner.processing.remove(key);
        if inner.dirty.remove(key) && !inner.shutdown && inner.queued.insert(key.to_string()) {
            inner.pending.push_back(key.to_string());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Requeue count for a key since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        let inner = self.inner.lock().expect("work queue poisoned");
        inner.requeues.get(key).copied().unwrap_or(0)
    }

    /// Clear a key's requeue count
    pub fn forget(&self, key: &str) {
        let mut inner = self.inner.lock().expect("work queue poisoned");
        inner.requeues.remove(key);
    }

    /// Stop the queue: all pulls return `None` from now on
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock().expect("work queue poisoned");
            inner.shutdown = true;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

/// Exponential per-attempt delay: 5ms doubling up to 1000s
fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(63);
    BASE_DELAY
        .checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX))
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}
