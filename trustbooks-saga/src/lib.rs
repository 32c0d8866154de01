#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Durable saga state machine. Forward steps run in declared order;
//! a failure flips the saga into compensation, which replays the
//! completed steps in reverse. Progress is driven by `saga.step.ready`
//! outbox events, so a crash between steps resumes from persisted
//! state.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

mod engine;
mod memory;

pub use engine::SagaDefinition;
pub use engine::SagaEngine;
pub use engine::SagaStepReadyHandler;
pub use engine::StepContext;
pub use engine::StepFailure;
pub use engine::StepOutcome;
pub use memory::InMemorySagaStore;

pub type SagaId = String;
pub type OrgId = String;

pub type SagaResult<T> = Result<T, SagaError>;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga {0} was not found")]
    NotFound(SagaId),
    #[error("saga {saga_id} is {status:?}, expected {expected}")]
    InvalidStatus {
        saga_id: SagaId,
        status: SagaStatus,
        expected: &'static str,
    },
    #[error("saga {saga_name} has no step {step}")]
    StepUnknown { saga_name: String, step: String },
    #[error("no saga definition registered under {0}")]
    DefinitionUnknown(String),
    #[error("step {step} of saga {saga_id} failed: {message}")]
    StepFailed {
        saga_id: SagaId,
        step: String,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Forward,
    Compensation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub id: SagaId,
    pub org_id: OrgId,
    pub saga_name: String,
    pub saga_version: u32,
    pub current_step: Option<String>,
    pub status: SagaStatus,
    pub steps_completed: Vec<String>,
    /// Remaining compensation queue, reverse order of completion.
    pub compensation_steps: Vec<String>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub initiated_by: String,
    pub trace_id: String,
}

impl SagaState {
    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = now;
        self.last_heartbeat = now;
    }

    fn require_status(&self, wanted: SagaStatus, expected: &'static str) -> SagaResult<()> {
        if self.status == wanted {
            Ok(())
        } else {
            Err(SagaError::InvalidStatus {
                saga_id: self.id.clone(),
                status: self.status,
                expected,
            })
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SagaStatus::Completed | SagaStatus::Compensated)
    }

    /// Complete the current step and move forward.
    pub fn advance(
        &mut self,
        next_step: impl Into<String>,
        payload: serde_json::Value,
    ) -> SagaResult<()> {
        self.require_status(SagaStatus::Running, "running")?;
        if let Some(step) = self.current_step.take() {
            self.steps_completed.push(step);
        }
        self.current_step = Some(next_step.into());
        self.payload = payload;
        self.touch();
        Ok(())
    }

    pub fn complete(&mut self, result: serde_json::Value) -> SagaResult<()> {
        self.require_status(SagaStatus::Running, "running")?;
        if let Some(step) = self.current_step.take() {
            self.steps_completed.push(step);
        }
        self.status = SagaStatus::Completed;
        self.result = Some(result);
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> SagaResult<()> {
        self.require_status(SagaStatus::Running, "running")?;
        self.status = SagaStatus::Failed;
        self.error_message = Some(error.into());
        self.error_step = self.current_step.clone();
        self.touch();
        Ok(())
    }

    /// Queue the completed steps for undo, newest first. A saga that
    /// never completed a step lands directly in `compensated`.
    pub fn start_compensation(&mut self) -> SagaResult<()> {
        self.require_status(SagaStatus::Failed, "failed")?;
        self.compensation_steps = self.steps_completed.iter().rev().cloned().collect();
        self.status = if self.compensation_steps.is_empty() {
            SagaStatus::Compensated
        } else {
            SagaStatus::Compensating
        };
        self.touch();
        Ok(())
    }

    /// Consume one compensation step; the last one finishes the saga.
    pub fn advance_compensation(&mut self, payload: serde_json::Value) -> SagaResult<()> {
        self.require_status(SagaStatus::Compensating, "compensating")?;
        if self.compensation_steps.is_empty() {
            return Err(SagaError::InvalidStatus {
                saga_id: self.id.clone(),
                status: self.status,
                expected: "compensating with pending steps",
            });
        }
        self.compensation_steps.remove(0);
        self.payload = payload;
        if self.compensation_steps.is_empty() {
            self.status = SagaStatus::Compensated;
        }
        self.touch();
        Ok(())
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    #[must_use]
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == SagaStatus::Running && self.timeout_at.is_some_and(|at| at < now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepLog {
    pub id: String,
    pub saga_id: SagaId,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SagaConfig {
    pub default_timeout_minutes: i64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_timeout_minutes: 30,
        }
    }
}

#[async_trait]
pub trait SagaStore: Send + Sync {
    async fn insert(&self, saga: SagaState) -> SagaResult<()>;
    async fn get(&self, saga_id: &SagaId) -> SagaResult<SagaState>;
    async fn update(&self, saga: SagaState) -> SagaResult<()>;
    async fn running(&self) -> SagaResult<Vec<SagaState>>;
    async fn append_step_log(&self, log: SagaStepLog) -> SagaResult<()>;
    async fn step_logs(&self, saga_id: &SagaId) -> SagaResult<Vec<SagaStepLog>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn saga() -> SagaState {
        let now = Utc::now();
        SagaState {
            id: "saga-1".into(),
            org_id: "org-1".into(),
            saga_name: "owner_distribution".into(),
            saga_version: 1,
            current_step: Some("CALCULATE_DISTRIBUTION".into()),
            status: SagaStatus::Running,
            steps_completed: Vec::new(),
            compensation_steps: Vec::new(),
            payload: serde_json::json!({}),
            result: None,
            error_message: None,
            error_step: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            last_heartbeat: now,
            timeout_at: Some(now + chrono::Duration::minutes(30)),
            initiated_by: "scheduler".into(),
            trace_id: "trace-1".into(),
        }
    }

    #[test]
    fn advance_appends_completed_steps_in_order() {
        let mut state = saga();
        state
            .advance("VALIDATE_RESERVES", serde_json::json!({"step": 1}))
            .expect("advance");
        state
            .advance("CREATE_JOURNAL_ENTRIES", serde_json::json!({"step": 2}))
            .expect("advance");

        assert_eq!(
            state.steps_completed,
            vec!["CALCULATE_DISTRIBUTION", "VALIDATE_RESERVES"]
        );
        assert_eq!(
            state.current_step.as_deref(),
            Some("CREATE_JOURNAL_ENTRIES")
        );
        assert_eq!(state.status, SagaStatus::Running);
    }

    #[test]
    fn complete_consumes_final_step() {
        let mut state = saga();
        state
            .complete(serde_json::json!({"distributed": "3900.0000"}))
            .expect("complete");
        assert_eq!(state.status, SagaStatus::Completed);
        assert_eq!(state.steps_completed, vec!["CALCULATE_DISTRIBUTION"]);
        assert_eq!(state.current_step, None);
        assert!(state.is_terminal());
    }

    #[test]
    fn advance_rejected_outside_running() {
        let mut state = saga();
        state.fail("bank rejected batch").expect("fail");
        let err = state
            .advance("VALIDATE_RESERVES", serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidStatus { .. }));
    }

    #[test]
    fn compensation_replays_steps_in_reverse() {
        let mut state = saga();
        state
            .advance("VALIDATE_RESERVES", serde_json::json!({}))
            .expect("advance");
        state
            .advance("CREATE_JOURNAL_ENTRIES", serde_json::json!({}))
            .expect("advance");
        state.fail("NACHA generation failed").expect("fail");
        assert_eq!(state.error_step.as_deref(), Some("CREATE_JOURNAL_ENTRIES"));

        state.start_compensation().expect("start compensation");
        assert_eq!(state.status, SagaStatus::Compensating);
        assert_eq!(
            state.compensation_steps,
            vec!["VALIDATE_RESERVES", "CALCULATE_DISTRIBUTION"]
        );

        state
            .advance_compensation(serde_json::json!({}))
            .expect("first compensation");
        assert_eq!(state.status, SagaStatus::Compensating);
        state
            .advance_compensation(serde_json::json!({}))
            .expect("last compensation");
        assert_eq!(state.status, SagaStatus::Compensated);
        assert!(state.is_terminal());
    }

    #[test]
    fn failed_saga_with_no_progress_compensates_immediately() {
        let mut state = saga();
        state.fail("reserves short").expect("fail");
        state.start_compensation().expect("start compensation");
        assert_eq!(state.status, SagaStatus::Compensated);
    }

    #[test]
    fn compensation_requires_failed_status() {
        let mut state = saga();
        let err = state.start_compensation().unwrap_err();
        assert!(matches!(err, SagaError::InvalidStatus { .. }));
    }

    #[test]
    fn timeout_detection_only_applies_to_running() {
        let mut state = saga();
        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(state.timed_out(later));

        state.complete(serde_json::json!({})).expect("complete");
        assert!(!state.timed_out(later));
    }
}
