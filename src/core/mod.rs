//! Core runtime.
//!
//! This module contains:
//! - Engine: registry of templates and instances, public operations
//! - Runner: the step loop
//! - Compensation: the rollback walk
//! - Resilience: bounded retries of failed instances
//! - Scheduler: delayed tasks for retries and evictions
//! - InstanceStore: persistence with in-process fallback

mod compensation;
pub mod engine;
pub mod instance_store;
mod resilience;
mod runner;
pub mod scheduler;

// Re-export commonly used types
pub use engine::Engine;
pub use instance_store::InstanceStore;
pub use scheduler::Scheduler;
