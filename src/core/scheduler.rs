//! Delayed-task scheduler.
//!
//! Owns every pending retry and eviction timer. Tasks are keyed; scheduling
//! under an existing key replaces the earlier task. Timers run on tokio's
//! clock, so tests can pause and advance time instead of sleeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type TaskMap = HashMap<String, (u64, CancellationToken)>;

/// Keyed delayed-task scheduler
#[derive(Clone, Default)]
pub struct Scheduler {
    tasks: Arc<Mutex<TaskMap>>,
    root: CancellationToken,
    next_id: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any task pending under `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, key: impl Into<String>, delay: Duration, task: BoxFuture<'static, ()>) {
        let key = key.into();
        if self.root.is_cancelled() {
            debug!(%key, "Scheduler shut down, task dropped");
            return;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = self.root.child_token();

        if let Some((_, previous)) = lock(&self.tasks).insert(key.clone(), (id, token.clone())) {
            previous.cancel();
        }

        let tasks = Arc::clone(&self.tasks);
        trace!(%key, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Task scheduled");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(%key, "Task cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // The entry is released before the task runs so the task
                    // can reschedule itself under the same key
                    release(&tasks, &key, id);
                    task.await;
                    return;
                }
            }
            release(&tasks, &key, id);
        });
    }

    /// Cancel the task pending under `key`, returning whether one existed
    pub fn cancel(&self, key: &str) -> bool {
        match lock(&self.tasks).remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending task whose key starts with `prefix`
    pub fn cancel_prefix(&self, prefix: &str) -> usize {
        let mut tasks = lock(&self.tasks);
        let keys: Vec<String> = tasks
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            if let Some((_, token)) = tasks.remove(key) {
                token.cancel();
            }
        }
        keys.len()
    }

    /// Number of tasks waiting for their timer
    pub fn pending(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Cancel everything and refuse new tasks
    pub fn shutdown(&self) {
        self.root.cancel();
        let cancelled = {
            let mut tasks = lock(&self.tasks);
            let count = tasks.len();
            tasks.clear();
            count
        };
        debug!(cancelled, "Scheduler shut down");
    }
}

fn release(tasks: &Mutex<TaskMap>, key: &str, id: u64) {
    let mut tasks = lock(tasks);
    if tasks.get(key).map(|(current, _)| *current == id).unwrap_or(false) {
        tasks.remove(key);
    }
}

fn lock(tasks: &Mutex<TaskMap>) -> MutexGuard<'_, TaskMap> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
