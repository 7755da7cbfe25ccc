//! Per-run state of a flow.
//!
//! An `Instance` is everything about a run that survives a restart: cursor,
//! context, per-step snapshots and outcomes. The step functions are not part
//! of it; they are re-attached from the registered template by tag.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::Context;
use super::flow::Flow;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, never executed
    #[default]
    Pending,

    /// Executing, or yielded mid-flow after a goto/branch/stop
    Running,

    /// All steps finished; terminal
    Done,

    /// A step failed and compensation ran
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of one forward or compensating invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: usize,
    pub name: String,

    /// Context returned by the function (empty on error)
    pub ctx: Context,

    /// How many times this step has been invoked in this run
    pub attempts: u32,

    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl StepRecord {
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Entry in the instance's transition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub status: InstanceStatus,
    pub step: Option<usize>,
    pub note: String,
}

/// A single execution of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub tag: String,
    pub version: String,

    /// Cursor into the template's steps, `0 <= current <= len(steps)`
    pub current: usize,

    /// Number of steps in the template when the instance was created
    pub total_steps: usize,

    /// Cumulative context
    pub ctx: Context,

    /// Caller-supplied metadata
    pub tags: Context,

    /// Snapshot of `ctx` taken when each step began
    pub ctxs: BTreeMap<usize, Context>,

    /// Latest forward outcome per step
    pub results: BTreeMap<usize, StepRecord>,

    /// Compensation outcomes, in invocation order
    pub rollbacks: Vec<StepRecord>,

    /// Lowest step index compensated by the most recent rollback walk
    pub last_rollback: Option<usize>,

    /// Steps marked terminal for this run by an explicit stop
    pub stops: BTreeSet<usize>,

    pub status: InstanceStatus,
    pub history: Vec<Transition>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub done_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Clone the shape of `flow` into a fresh pending instance
    pub fn from_flow(id: impl Into<String>, flow: &Flow, start_step: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tag: flow.tag.clone(),
            version: flow.version.clone(),
            current: start_step,
            total_steps: flow.steps.len(),
            ctx: Context::new(),
            tags: Context::new(),
            ctxs: BTreeMap::new(),
            results: BTreeMap::new(),
            rollbacks: Vec::new(),
            last_rollback: None,
            stops: BTreeSet::new(),
            status: InstanceStatus::Pending,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            done_at: None,
        }
    }

    /// Move to `status` and log the transition
    pub fn transition(&mut self, status: InstanceStatus, step: Option<usize>, note: impl Into<String>) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status == InstanceStatus::Done && self.done_at.is_none() {
            self.done_at = Some(now);
        }
        self.history.push(Transition {
            at: now,
            status,
            step,
            note: note.into(),
        });
    }

    /// Record a forward outcome, bumping the attempt count if the step ran before
    pub fn record_result(&mut self, step: usize, name: &str, ctx: Context, error: Option<String>) {
        let attempts = self.results.get(&step).map(|r| r.attempts + 1).unwrap_or(1);
        self.results.insert(
            step,
            StepRecord {
                step,
                name: name.to_string(),
                ctx,
                attempts,
                error,
                at: Utc::now(),
            },
        );
    }

    /// Record a compensation outcome
    pub fn record_rollback(&mut self, step: usize, name: &str, ctx: Context, error: Option<String>) {
        let attempts = self
            .rollbacks
            .iter()
            .filter(|r| r.step == step)
            .count() as u32
            + 1;
        self.rollbacks.push(StepRecord {
            step,
            name: name.to_string(),
            ctx,
            attempts,
            error,
            at: Utc::now(),
        });
    }

    pub fn result(&self, step: usize) -> Option<&StepRecord> {
        self.results.get(&step)
    }

    /// Latest compensation outcome of `step`
    pub fn rollback(&self, step: usize) -> Option<&StepRecord> {
        self.rollbacks.iter().rev().find(|r| r.step == step)
    }

    /// Where an explicit rollback should start walking down from.
    ///
    /// Resumes below the last compensated step; if that compensation
    /// failed it is attempted again.
    pub fn rollback_origin(&self) -> usize {
        match self.last_rollback {
            Some(step) if self.rollback(step).map(StepRecord::is_err).unwrap_or(false) => step + 1,
            Some(step) => step,
            None => self.current.min(self.total_steps),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == InstanceStatus::Done
    }
}

/// Out-of-band controls for a live instance.
///
/// Written by `stop`/`goto` callers without taking the instance lock and
/// read by the step loop after the in-flight step completes. Only valid
/// while the loop is driving; other lock holders never read it.
#[derive(Debug, Default)]
pub struct InstanceControl {
    current: AtomicUsize,
    goto: Mutex<Option<usize>>,
    stops: Mutex<BTreeSet<usize>>,
    driving: AtomicBool,
}

impl InstanceControl {
    pub fn for_instance(instance: &Instance) -> Self {
        Self {
            current: AtomicUsize::new(instance.current),
            goto: Mutex::new(None),
            stops: Mutex::new(instance.stops.clone()),
            driving: AtomicBool::new(false),
        }
    }

    /// Mark the step loop as running until the guard drops
    pub(crate) fn begin_drive(&self) -> DriveGuard<'_> {
        self.driving.store(true, Ordering::SeqCst);
        DriveGuard { control: self }
    }

    /// Whether the lock is held by the step loop
    pub fn is_driving(&self) -> bool {
        self.driving.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn set_current(&self, step: usize) {
        self.current.store(step, Ordering::SeqCst);
    }

    pub fn request_goto(&self, step: usize) {
        *lock(&self.goto) = Some(step);
    }

    pub fn take_goto(&self) -> Option<usize> {
        lock(&self.goto).take()
    }

    /// Mark the step at the cursor as terminal, returning its index
    pub fn stop_current(&self) -> usize {
        let step = self.current();
        lock(&self.stops).insert(step);
        step
    }

    pub fn is_stopped(&self, step: usize) -> bool {
        lock(&self.stops).contains(&step)
    }

    pub fn stops(&self) -> BTreeSet<usize> {
        lock(&self.stops).clone()
    }
}

/// Clears the driving flag on drop
pub(crate) struct DriveGuard<'a> {
    control: &'a InstanceControl,
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.control.driving.store(false, Ordering::SeqCst);
    }
}

// A poisoned control lock only means a step panicked; the data is still valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_input: super::super::flow::StepInput) -> anyhow::Result<Context> {
        Ok(Context::new())
    }

    fn instance() -> Instance {
        let flow = Flow::new("order.create", "1", "reserve", "", noop, false, "ops")
            .step("charge", "", noop, false)
            .step("ship", "", noop, false);
        Instance::from_flow("order-1", &flow, 0)
    }

    #[test]
    fn test_record_result_counts_attempts() {
        let mut inst = instance();
        inst.record_result(0, "reserve", Context::new(), Some("boom".into()));
        inst.record_result(0, "reserve", Context::new().with("ok", true), None);

        let record = inst.result(0).unwrap();
        assert_eq!(record.attempts, 2);
        assert!(!record.is_err());
    }

    #[test]
    fn test_rollback_origin() {
        let mut inst = instance();
        inst.current = 2;
        assert_eq!(inst.rollback_origin(), 2);

        // Strong-mode unwind interrupted at step 1: retry step 1 next time
        inst.record_rollback(1, "charge", Context::new(), Some("refund failed".into()));
        inst.last_rollback = Some(1);
        assert_eq!(inst.rollback_origin(), 2);

        inst.record_rollback(1, "charge", Context::new(), None);
        assert_eq!(inst.rollback_origin(), 1);
        assert_eq!(inst.rollback(1).unwrap().attempts, 2);
    }

    #[test]
    fn test_drive_guard_clears_on_drop() {
        let control = InstanceControl::for_instance(&instance());
        assert!(!control.is_driving());

        {
            let _driving = control.begin_drive();
            assert!(control.is_driving());
        }
        assert!(!control.is_driving());
    }

    #[test]
    fn test_done_sets_done_at_once() {
        let mut inst = instance();
        inst.transition(InstanceStatus::Running, Some(0), "started");
        assert!(inst.done_at.is_none());

        inst.transition(InstanceStatus::Done, None, "completed");
        let done_at = inst.done_at;
        assert!(done_at.is_some());
        assert!(inst.is_done());
        assert_eq!(inst.history.len(), 2);
    }

    #[test]
    fn test_control_stop_and_goto() {
        let inst = instance();
        let control = InstanceControl::for_instance(&inst);

        control.set_current(1);
        assert_eq!(control.stop_current(), 1);
        assert!(control.is_stopped(1));
        assert!(!control.is_stopped(2));

        control.request_goto(0);
        assert_eq!(control.take_goto(), Some(0));
        assert_eq!(control.take_goto(), None);
    }
}
