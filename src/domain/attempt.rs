//! Persisted state of a resilience attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::flow::ResiliencePolicy;

/// Status of a resilience attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    #[default]
    Pending,
    Running,
    Done,
    Stop,
    Failed,
}

/// Bounded retry bookkeeping for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Owning instance id
    pub id: String,

    /// Flow tag
    pub tag: String,

    pub status: AttemptStatus,

    /// Retries invoked so far
    pub attempt: u32,

    pub total_attempts: u32,

    /// Delay between retries in milliseconds
    pub time_attempts_ms: u64,

    pub retention_secs: u64,
    pub team: String,
    pub level: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(id: impl Into<String>, tag: impl Into<String>, policy: &ResiliencePolicy, retention: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            tag: tag.into(),
            status: AttemptStatus::Pending,
            attempt: 0,
            total_attempts: policy.total_attempts,
            time_attempts_ms: u64::try_from(policy.time_attempts.as_millis()).unwrap_or(u64::MAX),
            retention_secs: retention.as_secs(),
            team: policy.team.clone(),
            level: policy.level.clone(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.time_attempts_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn has_remaining(&self) -> bool {
        self.attempt < self.total_attempts
            && !matches!(self.status, AttemptStatus::Done | AttemptStatus::Stop)
    }

    /// Permanently failed: every allowed retry ran and the last one failed
    pub fn is_failed(&self) -> bool {
        self.status == AttemptStatus::Failed && self.attempt == self.total_attempts
    }

    pub fn set_status(&mut self, status: AttemptStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}
