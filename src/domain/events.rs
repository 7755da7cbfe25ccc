//! Notifications broadcast on state transitions.
//!
//! Delivery is best-effort: an observer may see a status event slightly
//! before or after the matching snapshot becomes readable from the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attempt::Attempt;
use super::flow::Flow;
use super::instance::{Instance, InstanceStatus};

/// A single notification payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    pub event_type: EventType,

    /// Flow tag the event belongs to
    pub tag: String,

    /// Instance id (instance and resilience events)
    pub instance_id: Option<String>,

    /// Step index (if applicable)
    pub step: Option<usize>,

    /// Status after the transition (instance events)
    pub status: Option<InstanceStatus>,

    /// Human-readable summary
    pub summary: String,

    pub error: Option<String>,

    /// Extra structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event_type: EventType, tag: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            tag: tag.into(),
            instance_id: None,
            step: None,
            status: None,
            summary: summary.into(),
            error: None,
            data: None,
        }
    }

    /// Status change of an instance, summarised from its latest transition
    pub fn status_changed(instance: &Instance) -> Self {
        let last = instance.history.last();
        let mut event = Self::new(
            EventType::InstanceStatusChanged,
            instance.tag.clone(),
            last.map(|t| t.note.clone()).unwrap_or_default(),
        );
        event.instance_id = Some(instance.id.clone());
        event.step = last.and_then(|t| t.step).or(Some(instance.current));
        event.status = Some(instance.status);
        event.error = last
            .and_then(|t| t.step)
            .and_then(|s| instance.result(s))
            .and_then(|r| r.error.clone())
            .filter(|_| instance.status == InstanceStatus::Failed);
        event
    }

    pub fn flow_registered(flow: &Flow) -> Self {
        Self::new(
            EventType::FlowRegistered,
            flow.tag.clone(),
            format!("Flow '{}' v{} registered", flow.name, flow.version),
        )
        .with_data(serde_json::json!({
            "name": flow.name,
            "version": flow.version,
            "description": flow.description,
            "created_by": flow.created_by,
            "steps": flow.steps.len(),
        }))
    }

    pub fn step_added(flow: &Flow, index: usize) -> Self {
        let step = &flow.steps[index];
        let mut event = Self::new(
            EventType::StepAdded,
            flow.tag.clone(),
            format!("Step '{}' added", step.name),
        )
        .with_data(serde_json::json!({
            "name": step.name,
            "description": step.description,
            "stop": step.stop,
            "expression": step.expression,
            "rollback": step.has_rollback(),
        }));
        event.step = Some(index);
        event
    }

    pub fn flow_deleted(tag: &str) -> Self {
        Self::new(EventType::FlowDeleted, tag, format!("Flow '{}' deleted", tag))
    }

    pub fn resilience_exhausted(attempt: &Attempt) -> Self {
        let mut event = Self::new(
            EventType::ResilienceExhausted,
            attempt.tag.clone(),
            format!(
                "Instance '{}' failed after {} attempts",
                attempt.id, attempt.attempt
            ),
        )
        .with_data(serde_json::json!({
            "team": attempt.team,
            "level": attempt.level,
            "attempts": attempt.attempt,
        }));
        event.instance_id = Some(attempt.id.clone());
        event.error = attempt.last_error.clone();
        event
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of notifications the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FlowRegistered,
    StepAdded,
    FlowDeleted,
    InstanceStatusChanged,
    ResilienceExhausted,
}
