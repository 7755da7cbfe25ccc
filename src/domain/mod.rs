//! Domain types for the saga engine.
//!
//! This module contains the core data structures:
//! - Context: key-value state threaded through steps
//! - Flow: templates, steps and their policies
//! - Instance: persisted per-run state
//! - Attempt: resilience retry bookkeeping
//! - Events: notification payloads

pub mod attempt;
pub mod context;
pub mod events;
pub mod flow;
pub mod instance;

// Re-export commonly used types
pub use attempt::{Attempt, AttemptStatus};
pub use context::Context;
pub use events::{Event, EventType};
pub use flow::{
    step_fn, Consistency, Flow, FlowPolicy, ResiliencePolicy, Step, StepFn, StepFuture, StepInput,
};
pub use instance::{Instance, InstanceControl, InstanceStatus, StepRecord, Transition};
