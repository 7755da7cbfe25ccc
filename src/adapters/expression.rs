//! JEXL predicate evaluator for branching steps.
//!
//! The context is passed as a JSON object, never interpolated into the
//! expression string. Nested values are addressed with dotted paths
//! (`order.amount`), the same keys a flattened view of the context has.
//! Only a strict boolean result counts; truthy values such as `1` or
//! `"yes"` are rejected.

use serde_json::Value;

use super::Evaluator;
use crate::domain::Context;
use crate::error::ExpressionError;

/// Evaluator backed by `jexl_eval`
#[derive(Debug, Default, Clone, Copy)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate and return the raw JSON value
    pub fn evaluate_value(&self, expression: &str, context: &Context) -> Result<Value, ExpressionError> {
        let evaluator = jexl_eval::Evaluator::new();
        evaluator
            .eval_in_context(expression, context.to_value())
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Evaluator for JexlEvaluator {
    fn evaluate(&self, expression: &str, context: &Context) -> Result<bool, ExpressionError> {
        match self.evaluate_value(expression, context)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpressionError::NotBoolean {
                expression: expression.to_string(),
                result: other,
            }),
        }
    }
}
