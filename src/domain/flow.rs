//! Flow templates and their steps.
//!
//! A flow is built once with the chained builder and registered with the
//! engine. Instances clone the template's shape and carry their own state;
//! the step functions themselves always come from the registered template.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::Context;
use super::instance::InstanceControl;
use crate::error::{EngineError, Result};

/// Boxed future returned by step functions
pub type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<Context>> + Send>>;

/// Forward or compensating function of a step
pub type StepFn = Arc<dyn Fn(StepInput) -> StepFuture + Send + Sync>;

/// Wrap an async closure into a [`StepFn`]
pub fn step_fn<F, Fut>(f: F) -> StepFn
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Context>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// What a step function receives when it is invoked
#[derive(Debug, Clone)]
pub struct StepInput {
    pub instance_id: String,
    pub tag: String,

    /// Index of the step being executed or compensated
    pub step: usize,

    /// Caller-supplied tags of the instance
    pub tags: Context,

    /// Current context for forward calls, the step's snapshot for rollbacks
    pub ctx: Context,

    control: Arc<InstanceControl>,
}

impl StepInput {
    pub(crate) fn new(
        instance_id: String,
        tag: String,
        step: usize,
        tags: Context,
        ctx: Context,
        control: Arc<InstanceControl>,
    ) -> Self {
        Self {
            instance_id,
            tag,
            step,
            tags,
            ctx,
            control,
        }
    }

    /// Request that the run jumps to `step` once this step completes.
    ///
    /// The jump consumes the rest of the current call: the engine records
    /// this step's result, moves the cursor and returns to the caller.
    pub fn goto(&self, step: usize) {
        self.control.request_goto(step);
    }
}

/// How rollback failures are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// Stop compensating at the first rollback error
    #[default]
    Strong,

    /// Record rollback errors and keep unwinding
    Eventual,
}

/// Automatic re-execution policy for failed instances
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResiliencePolicy {
    /// Number of retries after the original failure (0 disables resilience)
    pub total_attempts: u32,

    /// Fixed delay between retries
    pub time_attempts: Duration,

    /// Team to alert when retries are exhausted
    pub team: String,

    /// Alert severity
    pub level: String,
}

impl ResiliencePolicy {
    pub fn is_enabled(&self) -> bool {
        self.total_attempts > 0
    }
}

/// Policy overrides applied to a flow at registration (from configuration)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowPolicy {
    pub consistency: Option<Consistency>,
    pub total_attempts: Option<u32>,
    pub time_attempts_ms: Option<u64>,
    pub retention_secs: Option<u64>,
}

impl FlowPolicy {
    pub fn apply_to(&self, flow: &mut Flow) {
        if let Some(consistency) = self.consistency {
            flow.consistency = consistency;
        }
        if let Some(total) = self.total_attempts {
            flow.resilience.total_attempts = total;
        }
        if let Some(ms) = self.time_attempts_ms {
            flow.resilience.time_attempts = Duration::from_millis(ms);
        }
        if let Some(secs) = self.retention_secs {
            flow.retention = Some(Duration::from_secs(secs));
        }
    }
}

/// A single unit of work
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub description: String,

    /// End the run after this step succeeds, without advancing further
    pub stop: bool,

    /// Branch predicate evaluated after a successful forward call
    pub expression: Option<String>,

    /// Target when the predicate is true
    pub yes_goto: usize,

    /// Target when the predicate is false
    pub no_goto: usize,

    pub(crate) forward: StepFn,
    pub(crate) rollback: Option<StepFn>,
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        forward: StepFn,
        stop: bool,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            stop,
            expression: None,
            yes_goto: 0,
            no_goto: 0,
            forward,
            rollback: None,
        }
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("stop", &self.stop)
            .field("expression", &self.expression)
            .field("yes_goto", &self.yes_goto)
            .field("no_goto", &self.no_goto)
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

/// A flow template: ordered steps plus execution policy
#[derive(Debug, Clone)]
pub struct Flow {
    /// Unique template key
    pub tag: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,

    /// Ordered steps; the index is the step id
    pub steps: Vec<Step>,

    pub consistency: Consistency,
    pub resilience: ResiliencePolicy,

    /// How long persisted records live (engine default if unset)
    pub retention: Option<Duration>,
}

impl Flow {
    /// Start a flow definition; `forward` becomes step 0
    pub fn new<F, Fut>(
        tag: impl Into<String>,
        version: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        forward: F,
        stop_on_first_step: bool,
        created_by: impl Into<String>,
    ) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Context>> + Send + 'static,
    {
        let name = name.into();
        let description = description.into();
        let first = Step::new(
            name.clone(),
            description.clone(),
            step_fn(forward),
            stop_on_first_step,
        );

        Self {
            tag: tag.into(),
            version: version.into(),
            name,
            description,
            created_by: created_by.into(),
            created_at: Utc::now(),
            steps: vec![first],
            consistency: Consistency::default(),
            resilience: ResiliencePolicy::default(),
            retention: None,
        }
    }

    /// Append a step
    pub fn step<F, Fut>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        forward: F,
        stop: bool,
    ) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Context>> + Send + 'static,
    {
        self.steps
            .push(Step::new(name, description, step_fn(forward), stop));
        self
    }

    /// Attach a compensating function to the most recently added step
    pub fn rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Context>> + Send + 'static,
    {
        if let Some(step) = self.steps.last_mut() {
            step.rollback = Some(step_fn(rollback));
        }
        self
    }

    /// Make the most recently added step branch on `expression`
    pub fn if_else(mut self, expression: impl Into<String>, yes_goto: usize, no_goto: usize) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.expression = Some(expression.into());
            step.yes_goto = yes_goto;
            step.no_goto = no_goto;
        }
        self
    }

    pub fn consistency(mut self, mode: Consistency) -> Self {
        self.consistency = mode;
        self
    }

    pub fn resilience(
        mut self,
        total_attempts: u32,
        delay: Duration,
        team: impl Into<String>,
        level: impl Into<String>,
    ) -> Self {
        self.resilience = ResiliencePolicy {
            total_attempts,
            time_attempts: delay,
            team: team.into(),
            level: level.into(),
        };
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Validate the template before registration
    pub fn validate(&self) -> Result<()> {
        if self.tag.trim().is_empty() {
            return Err(EngineError::Validation("flow tag cannot be empty".into()));
        }

        if self.steps.is_empty() {
            return Err(EngineError::Validation(format!(
                "flow '{}' must have at least one step",
                self.tag
            )));
        }

        let len = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                return Err(EngineError::Validation(format!(
                    "step {} of '{}' has an empty name",
                    i, self.tag
                )));
            }

            if let Some(ref expression) = step.expression {
                if expression.trim().is_empty() {
                    return Err(EngineError::Validation(format!(
                        "step '{}' has an empty expression",
                        step.name
                    )));
                }
                // `len` is the terminal target
                if step.yes_goto > len || step.no_goto > len {
                    return Err(EngineError::Validation(format!(
                        "step '{}' branches outside [0, {}]: yes={} no={}",
                        step.name, len, step.yes_goto, step.no_goto
                    )));
                }
            }
        }

        Ok(())
    }
}
