//! The step loop.
//!
//! Runs steps from the instance cursor until the flow completes, a step
//! fails, or control is yielded back to the caller. Gotos, branches and
//! stops all yield: one of them consumes the rest of the current call.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::engine::EngineInner;
use crate::domain::{Context, Flow, Instance, InstanceControl, InstanceStatus, StepInput};
use crate::error::{EngineError, FailureKind, Result, StepFailure};

impl EngineInner {
    /// Drive `instance` forward. The caller holds the instance lock.
    pub(crate) async fn drive(
        &self,
        flow: &Flow,
        control: &Arc<InstanceControl>,
        instance: &mut Instance,
    ) -> Result<Context> {
        let _driving = control.begin_drive();
        let len = flow.steps.len();

        while instance.current < len {
            let index = instance.current;
            let step = &flow.steps[index];

            control.set_current(index);
            instance.stops.extend(control.stops());
            instance.ctxs.insert(index, instance.ctx.clone());
            instance.transition(
                InstanceStatus::Running,
                Some(index),
                format!("running step '{}'", step.name),
            );
            self.checkpoint(flow, instance).await;

            debug!(instance_id = %instance.id, tag = %flow.tag, step = index, name = %step.name, "Invoking step");
            let input = StepInput::new(
                instance.id.clone(),
                instance.tag.clone(),
                index,
                instance.tags.clone(),
                instance.ctx.clone(),
                Arc::clone(control),
            );

            let output = match (step.forward)(input).await {
                Ok(output) => output,
                Err(e) => {
                    let message = format!("{:#}", e);
                    return Err(self
                        .fail_step(flow, control, instance, index, FailureKind::Step, message)
                        .await);
                }
            };

            instance.record_result(index, &step.name, output.clone(), None);
            instance.ctx.merge(&output);
            instance.stops.extend(control.stops());

            if let Some(target) = control.take_goto() {
                if target > len {
                    let message = format!("goto target {} is outside [0, {}]", target, len);
                    return Err(self
                        .fail_step(flow, control, instance, index, FailureKind::Step, message)
                        .await);
                }
                instance.current = target;
                return Ok(self
                    .yield_at(flow, control, instance, format!("goto {}", target))
                    .await);
            }

            if step.stop || instance.stops.contains(&index) {
                instance.current = index + 1;
                info!(instance_id = %instance.id, tag = %flow.tag, step = index, "Stopping after step");
                return Ok(self
                    .yield_at(flow, control, instance, format!("stopped after step {}", index))
                    .await);
            }

            let Some(expression) = step.expression.as_deref() else {
                instance.current = index + 1;
                continue;
            };

            match self.evaluator.evaluate(expression, &instance.ctx) {
                Ok(matched) => {
                    let target = if matched { step.yes_goto } else { step.no_goto };
                    debug!(step = index, %expression, matched, target, "Branch evaluated");
                    instance.current = target;
                    return Ok(self
                        .yield_at(flow, control, instance, format!("goto {}", target))
                        .await);
                }
                Err(e) => {
                    return Err(self
                        .fail_step(flow, control, instance, index, FailureKind::Expression, e.to_string())
                        .await);
                }
            }
        }

        self.complete(flow, instance).await;
        Ok(instance.ctx.clone())
    }

    /// Hand control back to the caller with the cursor already moved
    async fn yield_at(
        &self,
        flow: &Flow,
        control: &InstanceControl,
        instance: &mut Instance,
        note: String,
    ) -> Context {
        if instance.current >= flow.steps.len() {
            self.complete(flow, instance).await;
        } else {
            control.set_current(instance.current);
            let current = instance.current;
            instance.transition(InstanceStatus::Running, Some(current), note);
            self.checkpoint(flow, instance).await;
        }
        instance.ctx.clone()
    }

    async fn complete(&self, flow: &Flow, instance: &mut Instance) {
        instance.current = flow.steps.len();
        instance.transition(InstanceStatus::Done, None, "done");
        self.checkpoint(flow, instance).await;
        info!(instance_id = %instance.id, tag = %flow.tag, "Instance done");
    }

    /// Record the failure, compensate, and build the error for the caller
    async fn fail_step(
        &self,
        flow: &Flow,
        control: &InstanceControl,
        instance: &mut Instance,
        index: usize,
        kind: FailureKind,
        message: String,
    ) -> EngineError {
        let name = flow.steps[index].name.clone();
        // A pending jump does not outlive the failed call
        control.take_goto();

        warn!(
            instance_id = %instance.id,
            tag = %flow.tag,
            step = index,
            name = %name,
            error = %message,
            "Step failed"
        );

        instance.record_result(index, &name, Context::new(), Some(message.clone()));
        instance.transition(
            InstanceStatus::Failed,
            Some(index),
            format!("step '{}' failed", name),
        );
        self.checkpoint(flow, instance).await;

        let compensation = self.compensate(flow, instance, index).await;
        self.persist(flow, instance).await;

        EngineError::StepFailed(Box::new(StepFailure {
            tag: flow.tag.clone(),
            instance_id: instance.id.clone(),
            step: index,
            name,
            kind,
            message,
            compensated: compensation.compensated,
            rollback_error: compensation.error.map(|(step, e)| format!("step {}: {}", step, e)),
        }))
    }
}
