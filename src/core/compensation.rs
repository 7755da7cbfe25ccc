//! Compensation walk.
//!
//! Rollback functions run from the step below the origin down to step 0,
//! each against the context snapshot taken when that step began.

use std::sync::Arc;

use tracing::{debug, warn};

use super::engine::EngineInner;
use crate::domain::{Consistency, Context, Flow, Instance, InstanceControl, StepInput};

/// Outcome of a compensation walk
#[derive(Debug, Default)]
pub(crate) struct Compensation {
    /// Merged outputs of the rollbacks that succeeded
    pub compensated: Context,

    /// First rollback error: step index and message
    pub error: Option<(usize, String)>,
}

impl EngineInner {
    /// Compensate steps `from - 1` down to `0`.
    ///
    /// Steps without a rollback function or without a snapshot are skipped.
    /// Strong consistency stops at the first rollback error; eventual
    /// consistency records it and keeps unwinding.
    pub(crate) async fn compensate(&self, flow: &Flow, instance: &mut Instance, from: usize) -> Compensation {
        let mut outcome = Compensation::default();
        // Rollbacks cannot steer the run
        let control = Arc::new(InstanceControl::default());

        for index in (0..from.min(flow.steps.len())).rev() {
            let step = &flow.steps[index];
            let Some(rollback) = step.rollback.as_ref() else {
                continue;
            };
            let Some(snapshot) = instance.ctxs.get(&index).cloned() else {
                continue;
            };

            instance.last_rollback = Some(index);
            let input = StepInput::new(
                instance.id.clone(),
                instance.tag.clone(),
                index,
                instance.tags.clone(),
                snapshot,
                Arc::clone(&control),
            );

            match rollback(input).await {
                Ok(output) => {
                    debug!(instance_id = %instance.id, tag = %flow.tag, step = index, "Step compensated");
                    outcome.compensated.merge(&output);
                    instance.record_rollback(index, &step.name, output, None);
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    warn!(
                        instance_id = %instance.id,
                        tag = %flow.tag,
                        step = index,
                        error = %message,
                        "Rollback failed"
                    );
                    instance.record_rollback(index, &step.name, Context::new(), Some(message.clone()));
                    if outcome.error.is_none() {
                        outcome.error = Some((index, message));
                    }
                    if flow.consistency == Consistency::Strong {
                        break;
                    }
                }
            }
        }

        outcome
    }
}
