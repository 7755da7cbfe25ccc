//! Resilience attempts: bounded, delayed re-execution of failed instances.
//!
//! The first failure of an instance whose flow allows retries creates an
//! attempt bound to a typed closure that resumes the instance with the
//! context captured at that failure. Every retry fires from the scheduler
//! after the flow's delay. The original run is not counted as an attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::engine::{Engine, EngineInner, InstanceKey};
use crate::domain::{Attempt, AttemptStatus, Context, Event, Flow};
use crate::error::{EngineError, Result};

/// Function re-invoked by each retry
pub(crate) type AttemptFn = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Context>> + Send + Sync>;

/// A live attempt and its bound function
pub(crate) struct AttemptHandle {
    record: Mutex<Attempt>,
    stopped: AtomicBool,
    ctx: Context,
    run: AttemptFn,
}

impl AttemptHandle {
    fn new(attempt: Attempt, ctx: Context, run: AttemptFn) -> Self {
        Self {
            record: Mutex::new(attempt),
            stopped: AtomicBool::new(false),
            ctx,
            run,
        }
    }

    pub async fn snapshot(&self) -> Attempt {
        self.record.lock().await.clone()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Resume an instance through a weak engine reference
fn resume_detached(
    weak: Weak<EngineInner>,
    id: String,
    tag: String,
    ctx: Context,
) -> BoxFuture<'static, Result<Context>> {
    Box::pin(async move {
        let inner = weak.upgrade().ok_or(EngineError::ShuttingDown)?;
        Engine { inner }.resume(&id, &tag, ctx).await
    })
}

impl EngineInner {
    /// Create the attempt for a failed instance, or report on the existing one.
    ///
    /// Returns whether a retry is still to come.
    pub(crate) async fn start_resilience(self: &Arc<Self>, flow: &Flow, id: &str, ctx: Context) -> bool {
        if !flow.resilience.is_enabled() || self.is_closed() {
            return false;
        }

        let key = InstanceKey::new(&flow.tag, id);
        let existing = self.attempts.get(&key).map(|h| Arc::clone(h.value()));
        if let Some(handle) = existing {
            return handle.record.lock().await.has_remaining();
        }

        let retention = self.retention(flow);
        let attempt = match self.store.load_attempt(&flow.tag, id).await {
            Some(persisted) if persisted.has_remaining() => persisted,
            Some(persisted) => {
                debug!(instance_id = %id, tag = %flow.tag, status = ?persisted.status, "Persisted attempt has no retries left");
                return false;
            }
            None => Attempt::new(id, &flow.tag, &flow.resilience, retention),
        };

        let run: AttemptFn = {
            let weak = Arc::downgrade(self);
            let id = id.to_string();
            let tag = flow.tag.clone();
            Arc::new(move |ctx| resume_detached(weak.clone(), id.clone(), tag.clone(), ctx))
        };

        let delay = attempt.delay();
        let handle = Arc::new(AttemptHandle::new(attempt.clone(), ctx, run));
        {
            use dashmap::mapref::entry::Entry;
            match self.attempts.entry(key.clone()) {
                // Another failure won the race
                Entry::Occupied(_) => return true,
                Entry::Vacant(entry) => {
                    entry.insert(handle);
                }
            }
        }

        self.store.save_attempt(&attempt).await;
        self.store.index_attempt(&flow.tag, id, retention).await;

        info!(
            instance_id = %id,
            tag = %flow.tag,
            total_attempts = attempt.total_attempts,
            delay_ms = attempt.time_attempts_ms,
            "Resilience attempt scheduled"
        );
        self.schedule_attempt(&key, delay);
        true
    }

    fn schedule_attempt(self: &Arc<Self>, key: &InstanceKey, delay: std::time::Duration) {
        let inner = Arc::clone(self);
        let task_key = key.clone();
        self.scheduler.schedule(
            key.attempt_task(),
            delay,
            Box::pin(async move {
                inner.run_attempt(task_key).await;
            }),
        );
    }

    /// One retry: bump the counter, invoke the bound function, record the outcome
    async fn run_attempt(self: Arc<Self>, key: InstanceKey) {
        let Some(handle) = self.attempts.get(&key).map(|h| Arc::clone(h.value())) else {
            return;
        };
        if handle.is_stopped() || self.is_closed() {
            debug!(instance_id = %key.id, tag = %key.tag, "Attempt stopped, retry skipped");
            return;
        }
        if self.instance_done(&key).await {
            self.retire_attempt(&key).await;
            return;
        }

        let number = {
            let mut record = handle.record.lock().await;
            record.attempt += 1;
            record.set_status(AttemptStatus::Running);
            self.store.save_attempt(&record).await;
            record.attempt
        };
        info!(instance_id = %key.id, tag = %key.tag, attempt = number, "Retrying instance");

        match (handle.run)(handle.ctx.clone()).await {
            Ok(_) => {
                handle.record.lock().await.set_status(AttemptStatus::Done);
                info!(instance_id = %key.id, tag = %key.tag, attempt = number, "Retry succeeded");
                self.retire_attempt(&key).await;
            }
            Err(e) => {
                let (remaining, delay, exhausted) = {
                    let mut record = handle.record.lock().await;
                    record.last_error = Some(e.to_string());
                    record.set_status(AttemptStatus::Failed);
                    self.store.save_attempt(&record).await;
                    (record.has_remaining(), record.delay(), record.clone())
                };

                if handle.is_stopped() {
                    return;
                }

                if remaining {
                    warn!(instance_id = %key.id, tag = %key.tag, attempt = number, error = %e, "Retry failed, rescheduling");
                    self.schedule_attempt(&key, delay);
                } else {
                    warn!(
                        instance_id = %key.id,
                        tag = %key.tag,
                        attempt = number,
                        team = %exhausted.team,
                        level = %exhausted.level,
                        "Retries exhausted"
                    );
                    // The persisted failed record stays; only the handle goes
                    self.attempts.remove_if(&key, |_, live| Arc::ptr_eq(live, &handle));
                    self.publish(
                        &self.config.topics.resilience_exhausted,
                        &Event::resilience_exhausted(&exhausted),
                    )
                    .await;
                }
            }
        }
    }

    async fn instance_done(&self, key: &InstanceKey) -> bool {
        let live = self.instances.get(key).map(|e| Arc::clone(e.value()));
        if let Some(live) = live {
            if let Ok(instance) = live.state.try_lock() {
                return instance.is_done();
            }
            return false;
        }

        self.store
            .load_instance(&key.tag, &key.id)
            .await
            .map(|instance| instance.is_done())
            .unwrap_or(false)
    }

    /// Destroy the attempt of a finished instance
    pub(crate) async fn retire_attempt(&self, key: &InstanceKey) {
        self.scheduler.cancel(&key.attempt_task());
        if let Some((_, handle)) = self.attempts.remove(key) {
            handle.stop();
            debug!(instance_id = %key.id, tag = %key.tag, "Attempt retired");
        }
        self.store.delete_attempt(&key.tag, &key.id).await;
    }

    /// Destroy the attempt of a stopped instance
    pub(crate) async fn stop_attempt(&self, key: &InstanceKey) {
        let cancelled = self.scheduler.cancel(&key.attempt_task());
        if let Some((_, handle)) = self.attempts.remove(key) {
            handle.stop();
            let mut record = handle.record.lock().await;
            record.set_status(AttemptStatus::Stop);
            info!(instance_id = %key.id, tag = %key.tag, cancelled, "Attempt stopped");
        }
        self.store.delete_attempt(&key.tag, &key.id).await;
    }

    /// Discard every attempt of a flow tag, returning how many were known
    pub(crate) async fn discard_attempts(&self, tag: &str) -> usize {
        self.scheduler.cancel_prefix(&format!("attempt:{}:", tag));

        let mut discarded = 0;
        self.attempts.retain(|key, handle| {
            if key.tag == tag {
                handle.stop();
                discarded += 1;
                false
            } else {
                true
            }
        });

        let persisted = self.store.delete_attempts_for_tag(tag).await;
        discarded.max(persisted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InstanceStatus;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle(delay: Duration) {
        tokio::time::sleep(delay).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn flaky(calls: &Arc<AtomicUsize>, succeed_on: usize, total: u32) -> Flow {
        let counter = Arc::clone(calls);
        Flow::new(
            "flaky",
            "1",
            "call",
            "",
            move |_input| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < succeed_on {
                        anyhow::bail!("call {} failed", n);
                    }
                    Ok(Context::new().with("calls", n as i64))
                }
            },
            false,
            "tests",
        )
        .resilience(total, Duration::from_secs(10), "platform", "critical")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_and_retires_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Engine::in_memory();
        engine.register(flaky(&calls, 2, 3)).await.unwrap();

        engine
            .run("a", "flaky", 0, Context::new(), Context::new())
            .await
            .unwrap_err();

        let attempt = engine.attempt("a", "flaky").await.unwrap();
        assert_eq!(attempt.attempt, 0);
        assert_eq!(attempt.status, AttemptStatus::Pending);

        settle(Duration::from_secs(11)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let instance = engine.instance("a", "flaky").await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Done);
        assert!(engine.attempt("a", "flaky").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_resilience_creates_no_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Engine::in_memory();
        engine.register(flaky(&calls, 5, 0)).await.unwrap();

        engine
            .run("a", "flaky", 0, Context::new(), Context::new())
            .await
            .unwrap_err();

        assert!(engine.attempt("a", "flaky").await.is_none());
        assert_eq!(engine.pending_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Engine::in_memory();
        engine.register(flaky(&calls, 5, 3)).await.unwrap();

        engine
            .run("a", "flaky", 0, Context::new(), Context::new())
            .await
            .unwrap_err();
        assert_eq!(engine.pending_tasks(), 1);

        engine.stop("a", "flaky").await.unwrap();
        assert_eq!(engine.pending_tasks(), 0);

        settle(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.attempt("a", "flaky").await.is_none());
    }
}
