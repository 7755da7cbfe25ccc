//! The engine: registry of flow templates and live instances.
//!
//! `Engine` is an explicit object, cheap to clone, passed to whoever needs
//! it. It owns the templates, the live instances, the resilience attempts
//! and the scheduler that drives retries and evictions.
//!
//! Each live instance sits behind its own async mutex. `run`, `resume` and
//! `rollback` take it with `try_lock`, so a second caller racing on the same
//! `(id, tag)` gets a state conflict instead of executing the loop twice.
//! `stop` and `goto` never wait for a running step loop: they write to the
//! instance's control block, which the loop reads once the in-flight step
//! returns. Any other holder is waited for, and the change is persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::instance_store::InstanceStore;
use super::resilience::AttemptHandle;
use super::scheduler::Scheduler;
use crate::adapters::{Evaluator, JexlEvaluator, LocalBus, MemoryStore, Message, Notifier, SqliteStore, Store};
use crate::config::EngineConfig;
use crate::domain::{Attempt, Context, Event, Flow, Instance, InstanceControl, InstanceStatus};
use crate::error::{EngineError, Result};

/// Identity of an instance: flow tag plus instance id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct InstanceKey {
    pub tag: String,
    pub id: String,
}

impl InstanceKey {
    pub fn new(tag: &str, id: &str) -> Self {
        Self {
            tag: tag.to_string(),
            id: id.to_string(),
        }
    }

    /// Scheduler key of the pending retry
    pub fn attempt_task(&self) -> String {
        format!("attempt:{}:{}", self.tag, self.id)
    }

    /// Scheduler key of the pending eviction
    pub fn eviction_task(&self) -> String {
        format!("evict:{}:{}", self.tag, self.id)
    }
}

/// An instance held in memory
pub(crate) struct LiveInstance {
    pub state: tokio::sync::Mutex<Instance>,
    pub control: Arc<InstanceControl>,
}

impl LiveInstance {
    fn new(instance: Instance) -> Self {
        let control = Arc::new(InstanceControl::for_instance(&instance));
        Self {
            state: tokio::sync::Mutex::new(instance),
            control,
        }
    }
}

/// Shared engine state
pub(crate) struct EngineInner {
    pub config: EngineConfig,
    pub flows: DashMap<String, Arc<Flow>>,
    pub instances: DashMap<InstanceKey, Arc<LiveInstance>>,
    pub attempts: DashMap<InstanceKey, Arc<AttemptHandle>>,
    pub store: InstanceStore,
    pub notifier: Arc<dyn Notifier>,
    pub evaluator: Arc<dyn Evaluator>,
    pub scheduler: Scheduler,
    closed: AtomicBool,
}

impl EngineInner {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn retention(&self, flow: &Flow) -> Duration {
        flow.retention.unwrap_or_else(|| self.config.default_retention())
    }

    /// Persist an instance without notifying
    pub async fn persist(&self, flow: &Flow, instance: &Instance) {
        self.store.save_instance(instance, self.retention(flow)).await;
    }

    /// Persist, then publish the status change
    pub async fn checkpoint(&self, flow: &Flow, instance: &Instance) {
        self.persist(flow, instance).await;
        self.publish(&self.config.topics.instance_status, &Event::status_changed(instance))
            .await;
    }

    /// Publish an event; failures are logged, never returned
    pub async fn publish(&self, topic: &str, event: &Event) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, error = %e, "Failed to serialize event");
                return;
            }
        };

        if let Err(e) = self.notifier.publish(topic, payload).await {
            warn!(topic, error = %e, "Failed to publish event");
        }
    }

    /// Remove a finished instance from memory.
    ///
    /// A holder of the instance lock pushes the eviction back by another
    /// delay.
    pub fn evict(self: &Arc<Self>, key: &InstanceKey) {
        let mut busy = false;
        let removed = self.instances.remove_if(key, |_, live| match live.state.try_lock() {
            Ok(instance) => instance.is_done(),
            Err(_) => {
                busy = true;
                false
            }
        });

        if removed.is_some() {
            debug!(instance_id = %key.id, tag = %key.tag, "Evicted finished instance");
        } else if busy {
            debug!(instance_id = %key.id, tag = %key.tag, "Instance busy, eviction deferred");
            self.schedule_eviction(key);
        }
    }

    /// Evict a finished instance after the configured delay
    pub fn schedule_eviction(self: &Arc<Self>, key: &InstanceKey) {
        let inner = Arc::clone(self);
        let task_key = key.clone();
        self.scheduler.schedule(
            key.eviction_task(),
            self.config.eviction_delay(),
            Box::pin(async move {
                inner.evict(&task_key);
            }),
        );
    }
}

/// Control message payload
#[derive(Debug, Deserialize)]
struct ControlMessage {
    id: String,
    tag: String,
}

/// Saga workflow engine
#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine over the given ports
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        let store = InstanceStore::new(store, config.key_prefix.clone());
        info!(prefix = %config.key_prefix, "Engine created");

        Self {
            inner: Arc::new(EngineInner {
                config,
                flows: DashMap::new(),
                instances: DashMap::new(),
                attempts: DashMap::new(),
                store,
                notifier,
                evaluator,
                scheduler: Scheduler::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// In-process engine with default configuration
    pub fn in_memory() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// In-process store and bus with the given configuration
    pub fn with_config(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalBus::default()),
            Arc::new(JexlEvaluator::new()),
        )
    }

    /// Engine persisting to the configured SQLite database
    pub fn with_sqlite(config: EngineConfig) -> Result<Self> {
        let store = SqliteStore::open_default(&config)?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(LocalBus::default()),
            Arc::new(JexlEvaluator::new()),
        ))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Generate a fresh instance id
    pub fn new_instance_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a flow template.
    ///
    /// Configured policy for the tag overrides the builder's policy.
    #[instrument(skip_all, fields(tag = %flow.tag))]
    pub async fn register(&self, mut flow: Flow) -> Result<()> {
        self.ensure_open()?;
        flow.validate()?;

        if let Some(policy) = self.inner.config.flow_policy(&flow.tag) {
            policy.apply_to(&mut flow);
        }

        let flow = Arc::new(flow);
        {
            use dashmap::mapref::entry::Entry;
            match self.inner.flows.entry(flow.tag.clone()) {
                Entry::Occupied(_) => {
                    return Err(EngineError::Validation(format!(
                        "flow '{}' is already registered",
                        flow.tag
                    )));
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&flow));
                }
            }
        }

        info!(steps = flow.steps.len(), version = %flow.version, "Flow registered");

        let topics = &self.inner.config.topics;
        self.inner
            .publish(&topics.flow_registered, &Event::flow_registered(&flow))
            .await;
        for index in 0..flow.steps.len() {
            self.inner
                .publish(&topics.step_added, &Event::step_added(&flow, index))
                .await;
        }

        Ok(())
    }

    /// Start an instance, creating it from the template if needed.
    ///
    /// A new instance begins at `start_step`. Only pending instances run;
    /// failed ones resume through [`Engine::resume`] or their retries.
    #[instrument(skip_all, fields(instance_id = %id, tag = %tag))]
    pub async fn run(
        &self,
        id: &str,
        tag: &str,
        start_step: usize,
        tags: Context,
        ctx: Context,
    ) -> Result<Context> {
        self.ensure_open()?;
        validate_ids(id, tag)?;
        let flow = self.template(tag)?;

        if start_step > flow.steps.len() {
            return Err(EngineError::Validation(format!(
                "start step {} is outside [0, {}]",
                start_step,
                flow.steps.len()
            )));
        }

        let live = self.get_or_create(&flow, id, start_step).await;

        let (outcome, status, retry_ctx) = {
            let mut instance = live.state.try_lock().map_err(|_| in_flight(id, tag))?;

            match instance.status {
                InstanceStatus::Pending => {}
                InstanceStatus::Failed => {
                    return Err(EngineError::StateConflict(format!(
                        "instance '{}' of '{}' failed; use resume",
                        id, tag
                    )));
                }
                status => {
                    return Err(EngineError::StateConflict(format!(
                        "instance '{}' of '{}' is {}",
                        id,
                        tag,
                        status.as_str()
                    )));
                }
            }

            instance.tags.merge(&tags);
            instance.ctx.merge(&ctx);
            info!(current = instance.current, "Running instance");

            let outcome = self.inner.drive(&flow, &live.control, &mut instance).await;
            (outcome, instance.status, instance.ctx.clone())
        };

        self.settle(&flow, id, &outcome, status, retry_ctx).await;
        outcome
    }

    /// Continue an existing instance from its persisted cursor
    #[instrument(skip_all, fields(instance_id = %id, tag = %tag))]
    pub async fn resume(&self, id: &str, tag: &str, ctx: Context) -> Result<Context> {
        self.ensure_open()?;
        validate_ids(id, tag)?;
        let flow = self.template(tag)?;

        let live = self
            .get_existing(&flow, id)
            .await
            .ok_or_else(|| not_found(id, tag))?;

        let (outcome, status, retry_ctx) = {
            let mut instance = live.state.try_lock().map_err(|_| in_flight(id, tag))?;

            if instance.is_done() {
                return Err(EngineError::StateConflict(format!(
                    "instance '{}' of '{}' is done",
                    id, tag
                )));
            }

            instance.ctx.merge(&ctx);
            info!(current = instance.current, status = instance.status.as_str(), "Resuming instance");

            let outcome = self.inner.drive(&flow, &live.control, &mut instance).await;
            (outcome, instance.status, instance.ctx.clone())
        };

        self.settle(&flow, id, &outcome, status, retry_ctx).await;
        outcome
    }

    /// Compensate an instance that is failed or done.
    ///
    /// Picks up where the previous compensation stopped: below
    /// `last_rollback`, or at it again when that rollback had failed.
    #[instrument(skip_all, fields(instance_id = %id, tag = %tag))]
    pub async fn rollback(&self, id: &str, tag: &str) -> Result<Context> {
        self.ensure_open()?;
        validate_ids(id, tag)?;
        let flow = self.template(tag)?;

        let live = self
            .get_existing(&flow, id)
            .await
            .ok_or_else(|| not_found(id, tag))?;
        let mut instance = live.state.try_lock().map_err(|_| in_flight(id, tag))?;

        if matches!(instance.status, InstanceStatus::Pending | InstanceStatus::Running) {
            return Err(EngineError::StateConflict(format!(
                "cannot roll back instance '{}' of '{}' while {}",
                id,
                tag,
                instance.status.as_str()
            )));
        }

        let from = instance.rollback_origin();
        info!(from, "Rolling back instance");

        let compensation = self.inner.compensate(&flow, &mut instance, from).await;
        let status = instance.status;
        instance.transition(status, Some(from), "rollback");
        self.inner.checkpoint(&flow, &instance).await;

        match compensation.error {
            None => Ok(compensation.compensated),
            Some((step, message)) => Err(EngineError::RollbackFailed {
                step,
                message,
                compensated: compensation.compensated,
            }),
        }
    }

    /// Make the step at the cursor terminal for this instance.
    ///
    /// An in-flight step is not interrupted; the run ends after it succeeds.
    /// Also stops any pending retry.
    #[instrument(skip_all, fields(instance_id = %id, tag = %tag))]
    pub async fn stop(&self, id: &str, tag: &str) -> Result<()> {
        validate_ids(id, tag)?;
        let flow = self.template(tag)?;

        let live = self
            .get_existing(&flow, id)
            .await
            .ok_or_else(|| not_found(id, tag))?;

        match lock_unless_driving(&live).await {
            Some(mut instance) => {
                if instance.is_done() {
                    return Err(EngineError::StateConflict(format!(
                        "instance '{}' of '{}' is done",
                        id, tag
                    )));
                }
                let step = instance.current;
                live.control.set_current(step);
                live.control.stop_current();
                instance.stops.insert(step);
                self.inner.persist(&flow, &instance).await;
                info!(step, "Stop recorded");
            }
            None => {
                let step = live.control.stop_current();
                info!(step, "Stop recorded for in-flight step");
            }
        }

        self.inner.stop_attempt(&InstanceKey::new(tag, id)).await;
        Ok(())
    }

    /// Override the next step of an instance.
    ///
    /// While a step is in flight the jump applies once it completes.
    /// Otherwise the cursor moves as soon as the instance lock is free.
    #[instrument(skip_all, fields(instance_id = %id, tag = %tag))]
    pub async fn goto(&self, id: &str, tag: &str, step: usize) -> Result<()> {
        validate_ids(id, tag)?;
        let flow = self.template(tag)?;

        if step > flow.steps.len() {
            return Err(EngineError::Validation(format!(
                "goto target {} is outside [0, {}]",
                step,
                flow.steps.len()
            )));
        }

        let live = self
            .get_existing(&flow, id)
            .await
            .ok_or_else(|| not_found(id, tag))?;

        match lock_unless_driving(&live).await {
            Some(mut instance) => {
                if instance.is_done() {
                    return Err(EngineError::StateConflict(format!(
                        "instance '{}' of '{}' is done",
                        id, tag
                    )));
                }
                instance.current = step;
                live.control.set_current(step);
                let status = instance.status;
                instance.transition(status, Some(step), format!("goto {}", step));
                self.inner.persist(&flow, &instance).await;
            }
            None => live.control.request_goto(step),
        }

        debug!(step, "Goto recorded");
        Ok(())
    }

    /// Remove a flow template and discard its resilience state.
    ///
    /// Existing instances are left untouched.
    #[instrument(skip(self))]
    pub async fn delete_flow(&self, tag: &str) -> Result<bool> {
        if tag.trim().is_empty() {
            return Err(EngineError::Validation("tag cannot be empty".into()));
        }
        if !self.inner.flows.contains_key(tag) {
            return Err(EngineError::NotFound(format!("flow '{}'", tag)));
        }

        self.inner
            .publish(&self.inner.config.topics.flow_deleted, &Event::flow_deleted(tag))
            .await;
        self.inner.flows.remove(tag);

        let discarded = self.inner.discard_attempts(tag).await;
        info!(discarded, "Flow deleted");
        Ok(true)
    }

    /// True while the engine is open and the primary store answers
    pub async fn health_check(&self) -> bool {
        if self.inner.is_closed() {
            return false;
        }

        match self.inner.store.probe().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!(error = %e, "Health probe failed");
                false
            }
        }
    }

    /// Cancel pending retries and evictions and refuse new work
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.scheduler.shutdown();
        info!("Engine shut down");
    }

    /// Snapshot of an instance, from memory or the store
    pub async fn instance(&self, id: &str, tag: &str) -> Option<Instance> {
        let live = self
            .inner
            .instances
            .get(&InstanceKey::new(tag, id))
            .map(|entry| Arc::clone(entry.value()));

        if let Some(live) = live {
            if let Ok(instance) = live.state.try_lock() {
                return Some(instance.clone());
            }
        }

        self.inner.store.load_instance(tag, id).await
    }

    /// Registered flow tags, sorted
    pub fn flows(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.inner.flows.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    pub fn flow(&self, tag: &str) -> Option<Arc<Flow>> {
        self.inner.flows.get(tag).map(|e| Arc::clone(e.value()))
    }

    /// Resilience attempt of an instance, if one exists
    pub async fn attempt(&self, id: &str, tag: &str) -> Option<Attempt> {
        let handle = self
            .inner
            .attempts
            .get(&InstanceKey::new(tag, id))
            .map(|e| Arc::clone(e.value()));

        match handle {
            Some(handle) => Some(handle.snapshot().await),
            None => self.inner.store.load_attempt(tag, id).await,
        }
    }

    /// Number of retries and evictions waiting on a timer
    pub fn pending_tasks(&self) -> usize {
        self.inner.scheduler.pending()
    }

    /// Number of instances held in memory
    pub fn live_instances(&self) -> usize {
        self.inner.instances.len()
    }

    /// Number of resilience attempts held in memory
    pub fn live_attempts(&self) -> usize {
        self.inner.attempts.len()
    }

    /// Subscribe to the control topics.
    ///
    /// Payloads are `{"id": .., "tag": ..}`. A stop message calls
    /// [`Engine::stop`]; a restart message calls [`Engine::resume`] with
    /// the persisted context.
    pub fn listen_control(&self) -> Result<()> {
        let topics = &self.inner.config.topics;

        let weak = Arc::downgrade(&self.inner);
        self.inner.notifier.subscribe(
            &topics.control_stop,
            Arc::new(move |message: Message| {
                let Some((engine, control)) = control_target(&weak, message) else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = engine.stop(&control.id, &control.tag).await {
                        warn!(instance_id = %control.id, tag = %control.tag, error = %e, "Control stop failed");
                    }
                });
            }),
        )?;

        let weak = Arc::downgrade(&self.inner);
        self.inner.notifier.subscribe(
            &topics.control_restart,
            Arc::new(move |message: Message| {
                let Some((engine, control)) = control_target(&weak, message) else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(e) = engine.resume(&control.id, &control.tag, Context::new()).await {
                        warn!(instance_id = %control.id, tag = %control.tag, error = %e, "Control restart failed");
                    }
                });
            }),
        )?;

        info!("Listening for control messages");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    fn template(&self, tag: &str) -> Result<Arc<Flow>> {
        self.flow(tag)
            .ok_or_else(|| EngineError::NotFound(format!("flow '{}'", tag)))
    }

    /// Live instance from memory, else reconstructed from the store
    async fn get_existing(&self, flow: &Arc<Flow>, id: &str) -> Option<Arc<LiveInstance>> {
        let key = InstanceKey::new(&flow.tag, id);
        let live = self.inner.instances.get(&key).map(|e| Arc::clone(e.value()));
        if live.is_some() {
            return live;
        }

        let mut instance = self.inner.store.load_instance(&flow.tag, id).await?;
        // Steps always come from the registered template
        instance.total_steps = flow.steps.len();
        instance.current = instance.current.min(flow.steps.len());
        let done = instance.is_done();
        debug!(instance_id = %id, tag = %flow.tag, done, "Instance reconstructed from store");

        let live = self.adopt(key.clone(), instance);
        if done {
            self.inner.schedule_eviction(&key);
        }
        Some(live)
    }

    async fn get_or_create(&self, flow: &Arc<Flow>, id: &str, start_step: usize) -> Arc<LiveInstance> {
        if let Some(live) = self.get_existing(flow, id).await {
            return live;
        }

        let instance = Instance::from_flow(id, flow, start_step);
        debug!(instance_id = %id, tag = %flow.tag, start_step, "Instance created");
        self.adopt(InstanceKey::new(&flow.tag, id), instance)
    }

    /// Insert unless another caller got there first
    fn adopt(&self, key: InstanceKey, instance: Instance) -> Arc<LiveInstance> {
        let entry = self
            .inner
            .instances
            .entry(key)
            .or_insert_with(|| Arc::new(LiveInstance::new(instance)));
        Arc::clone(entry.value())
    }

    /// Follow-up once the instance lock is released
    async fn settle(
        &self,
        flow: &Arc<Flow>,
        id: &str,
        outcome: &Result<Context>,
        status: InstanceStatus,
        ctx: Context,
    ) {
        let key = InstanceKey::new(&flow.tag, id);
        match outcome {
            Ok(_) if status == InstanceStatus::Done => {
                self.inner.retire_attempt(&key).await;
                self.inner.schedule_eviction(&key);
            }
            Err(EngineError::StepFailed(_)) => {
                self.inner.start_resilience(flow, id, ctx).await;
            }
            _ => {}
        }
    }
}

/// The instance lock, or `None` while the step loop holds it
async fn lock_unless_driving(live: &LiveInstance) -> Option<tokio::sync::MutexGuard<'_, Instance>> {
    match live.state.try_lock() {
        Ok(instance) => Some(instance),
        Err(_) if live.control.is_driving() => None,
        Err(_) => Some(live.state.lock().await),
    }
}

fn control_target(
    weak: &std::sync::Weak<EngineInner>,
    message: Message,
) -> Option<(Engine, ControlMessage)> {
    let inner = weak.upgrade()?;
    match serde_json::from_value::<ControlMessage>(message.payload) {
        Ok(control) => Some((Engine { inner }, control)),
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Ignoring malformed control message");
            None
        }
    }
}

fn validate_ids(id: &str, tag: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(EngineError::Validation("instance id cannot be empty".into()));
    }
    if tag.trim().is_empty() {
        return Err(EngineError::Validation("tag cannot be empty".into()));
    }
    Ok(())
}

fn not_found(id: &str, tag: &str) -> EngineError {
    EngineError::NotFound(format!("instance '{}' of '{}'", id, tag))
}

fn in_flight(id: &str, tag: &str) -> EngineError {
    EngineError::StateConflict(format!("instance '{}' of '{}' is in flight", id, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepInput;

    async fn pass(input: StepInput) -> anyhow::Result<Context> {
        Ok(Context::new().with(format!("step{}", input.step), true))
    }

    fn two_step() -> Flow {
        Flow::new("test.flow", "1", "first", "", pass, false, "tests").step("second", "", pass, false)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let engine = Engine::in_memory();
        engine.register(two_step()).await.unwrap();

        let err = engine.register(two_step()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(engine.flows(), vec!["test.flow"]);
    }

    #[tokio::test]
    async fn test_register_applies_configured_policy() {
        let config = EngineConfig::default().with_flow_policy(
            "test.flow",
            crate::domain::FlowPolicy {
                total_attempts: Some(2),
                ..Default::default()
            },
        );
        let engine = Engine::with_config(config);
        engine.register(two_step()).await.unwrap();

        let flow = engine.flow("test.flow").unwrap();
        assert_eq!(flow.resilience.total_attempts, 2);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let engine = Engine::in_memory();
        engine.register(two_step()).await.unwrap();

        let empty_id = engine
            .run("", "test.flow", 0, Context::new(), Context::new())
            .await;
        assert!(matches!(empty_id, Err(EngineError::Validation(_))));

        let bad_start = engine
            .run("a", "test.flow", 3, Context::new(), Context::new())
            .await;
        assert!(matches!(bad_start, Err(EngineError::Validation(_))));

        let unknown = engine
            .run("a", "missing", 0, Context::new(), Context::new())
            .await;
        assert!(unknown.unwrap_err().is_not_found());

        assert!(engine.instance("a", "test.flow").await.is_none());
    }

    #[tokio::test]
    async fn test_run_to_done_and_conflict_on_rerun() {
        let engine = Engine::in_memory();
        engine.register(two_step()).await.unwrap();

        let ctx = engine
            .run("a", "test.flow", 0, Context::new(), Context::new().with("seed", 1))
            .await
            .unwrap();
        assert_eq!(ctx.get_bool("step0"), Some(true));
        assert_eq!(ctx.get_bool("step1"), Some(true));
        assert_eq!(ctx.get_i64("seed"), Some(1));

        let before = engine.instance("a", "test.flow").await.unwrap();
        assert_eq!(before.status, InstanceStatus::Done);
        assert_eq!(before.current, 2);
        assert!(before.done_at.is_some());

        let again = engine
            .run("a", "test.flow", 0, Context::new(), Context::new().with("seed", 2))
            .await;
        assert!(again.unwrap_err().is_state_conflict());

        let after = engine.instance("a", "test.flow").await.unwrap();
        assert_eq!(after.ctx, before.ctx);
        assert_eq!(after.results, before.results);
    }

    #[tokio::test]
    async fn test_start_step_skips_earlier_steps() {
        let engine = Engine::in_memory();
        engine.register(two_step()).await.unwrap();

        let ctx = engine
            .run("b", "test.flow", 1, Context::new(), Context::new())
            .await
            .unwrap();

        assert!(!ctx.contains_key("step0"));
        assert_eq!(ctx.get_bool("step1"), Some(true));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_work() {
        let engine = Engine::in_memory();
        engine.register(two_step()).await.unwrap();
        assert!(engine.health_check().await);

        engine.shutdown();

        assert!(!engine.health_check().await);
        let result = engine
            .run("a", "test.flow", 0, Context::new(), Context::new())
            .await;
        assert!(matches!(result, Err(EngineError::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_instance_is_evicted_after_delay() {
        let config = EngineConfig::default().with_eviction_delay(Duration::from_secs(5));
        let engine = Engine::with_config(config);
        engine.register(two_step()).await.unwrap();

        engine
            .run("a", "test.flow", 0, Context::new(), Context::new())
            .await
            .unwrap();
        assert_eq!(engine.live_instances(), 1);
        assert_eq!(engine.pending_tasks(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.live_instances(), 0);
        // Still readable from the store
        let instance = engine.instance("a", "test.flow").await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Done);
    }

    async fn advance(by: Duration) {
        tokio::time::sleep(by).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reloaded_done_instance_is_evicted_again() {
        let config = EngineConfig::default().with_eviction_delay(Duration::from_secs(5));
        let engine = Engine::with_config(config);
        engine.register(two_step()).await.unwrap();

        engine
            .run("a", "test.flow", 0, Context::new(), Context::new())
            .await
            .unwrap();
        advance(Duration::from_secs(6)).await;
        assert_eq!(engine.live_instances(), 0);

        // Reloading to answer the conflict brings it back into memory
        let again = engine.resume("a", "test.flow", Context::new()).await;
        assert!(again.unwrap_err().is_state_conflict());
        assert_eq!(engine.live_instances(), 1);
        assert_eq!(engine.pending_tasks(), 1);

        advance(Duration::from_secs(6)).await;
        assert_eq!(engine.live_instances(), 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_non_driving_holder_and_persists() {
        let engine = Engine::in_memory();
        let flow = Flow::new("halt.flow", "1", "first", "", pass, true, "tests")
            .step("second", "", pass, false)
            .step("third", "", pass, false);
        engine.register(flow).await.unwrap();

        engine
            .run("a", "halt.flow", 0, Context::new(), Context::new())
            .await
            .unwrap();

        let live = engine
            .inner
            .instances
            .get(&InstanceKey::new("halt.flow", "a"))
            .map(|entry| Arc::clone(entry.value()))
            .unwrap();
        let guard = live.state.lock().await;
        assert!(!live.control.is_driving());

        let stopper = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.stop("a", "halt.flow").await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!stopper.is_finished());

        drop(guard);
        stopper.await.unwrap().unwrap();

        let persisted = engine.inner.store.load_instance("halt.flow", "a").await.unwrap();
        assert_eq!(persisted.current, 1);
        assert!(persisted.stops.contains(&1));

        let ctx = engine.resume("a", "halt.flow", Context::new()).await.unwrap();
        assert_eq!(ctx.get_bool("step1"), Some(true));
        assert!(!ctx.contains_key("step2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_waits_for_busy_instance() {
        let config = EngineConfig::default().with_eviction_delay(Duration::from_secs(5));
        let engine = Engine::with_config(config);
        engine.register(two_step()).await.unwrap();

        engine
            .run("a", "test.flow", 0, Context::new(), Context::new())
            .await
            .unwrap();

        let live = engine
            .inner
            .instances
            .get(&InstanceKey::new("test.flow", "a"))
            .map(|entry| Arc::clone(entry.value()))
            .unwrap();
        let guard = live.state.lock().await;

        advance(Duration::from_secs(6)).await;
        assert_eq!(engine.live_instances(), 1);
        assert_eq!(engine.pending_tasks(), 1);

        drop(guard);
        advance(Duration::from_secs(6)).await;
        assert_eq!(engine.live_instances(), 0);
    }
}
