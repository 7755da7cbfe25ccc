//! sagaflow - Saga-style workflow engine
//!
//! Runs named, ordered steps against a shared context, persists progress
//! after every transition so an instance can be resumed after a crash,
//! compensates completed steps when a later one fails, and optionally
//! retries failed instances a bounded number of times.
//!
//! # Architecture
//!
//! - Flows are templates: ordered steps, each with a forward function, an
//!   optional rollback, an optional branch predicate and a stop flag
//! - Instances are per-run state cloned from a template and owned by the
//!   engine; step functions are always taken from the registered template
//! - Every transition is persisted first, then published
//!
//! # Modules
//!
//! - `adapters`: Ports (store, notifier, evaluator) and their implementations
//! - `core`: Engine, step loop, compensation, retries, scheduler
//! - `domain`: Data structures (Flow, Instance, Attempt, Context, Event)
//! - `config`: Engine configuration
//!
//! # Usage
//!
//! ```no_run
//! use sagaflow::{Context, Engine, Flow, StepInput};
//!
//! async fn reserve(input: StepInput) -> anyhow::Result<Context> {
//!     Ok(Context::new().with("reserved", input.ctx.get_i64("qty").unwrap_or(0)))
//! }
//!
//! async fn release(_input: StepInput) -> anyhow::Result<Context> {
//!     Ok(Context::new().with("released", true))
//! }
//!
//! # async fn example() -> sagaflow::Result<()> {
//! let engine = Engine::in_memory();
//! engine
//!     .register(Flow::new("order.create", "1", "reserve_stock", "", reserve, false, "ops").rollback(release))
//!     .await?;
//!
//! let ctx = engine
//!     .run("order-1", "order.create", 0, Context::new(), Context::new().with("qty", 2))
//!     .await?;
//! assert_eq!(ctx.get_i64("reserved"), Some(2));
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod observe;

// Re-export main types at crate root for convenience
pub use adapters::{Evaluator, JexlEvaluator, LocalBus, MemoryStore, Notifier, SqliteStore, Store};
pub use config::{EngineConfig, Topics};
pub use crate::core::Engine;
pub use domain::{
    Attempt, AttemptStatus, Consistency, Context, Event, EventType, Flow, FlowPolicy, Instance,
    InstanceStatus, StepInput, StepRecord,
};
pub use error::{EngineError, FailureKind, Result, StepFailure};
pub use observe::init_tracing;
