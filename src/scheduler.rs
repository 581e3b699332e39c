//! Per-container expiry tasks.
//!
//! Each scheduled expiry is a tokio task addressed by container id. A task
//! detaches itself from the table before running its callback, so cancelling
//! an id never aborts a teardown that has already begun. Late firings are
//! harmless: the callback goes through the store's compare-and-set.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

struct Scheduled {
    token: u64,
    deadline: Instant,
    handle: AbortHandle,
}

#[derive(Default)]
pub struct ExpiryScheduler {
    tasks: Mutex<HashMap<String, Scheduled>>,
    next_token: AtomicU64,
}

impl ExpiryScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `on_fire` after `delay`. Re-scheduling an id replaces (and aborts)
    /// its previous task.
    pub fn schedule<F, Fut>(self: &Arc<Self>, id: &str, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let scheduler = Arc::clone(self);
        let task_id = id.to_string();

        // Held across spawn so the task cannot detach before it is registered.
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if scheduler.detach(&task_id, token) {
                on_fire().await;
            }
        })
        .abort_handle();

        let previous = tasks.insert(
            id.to_string(),
            Scheduled {
                token,
                deadline,
                handle,
            },
        );
        if let Some(previous) = previous {
            debug!(id = %id, "Replacing scheduled expiry");
            previous.handle.abort();
        }
    }

    fn detach(&self, id: &str, token: u64) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get(id) {
            Some(entry) if entry.token == token => {
                tasks.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Cancel the pending expiry for `id`. Returns whether one was pending.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tasks.lock().remove(id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Scheduled> = self.tasks.lock().drain().map(|(_, s)| s).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.tasks.lock().contains_key(id)
    }

    pub fn deadline(&self, id: &str) -> Option<Instant> {
        self.tasks.lock().get(id).map(|s| s.deadline)
    }

    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
