use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::BridgeError;

/// Terminal state of one step after the saga finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    NotExecuted,
    Committed,
    Failed { error: String },
    Cancelled,
    Compensated,
    CompensationFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    StepError { message: String },
    Timeout { after_ms: u64 },
    OperatorCancelled,
    /// The step committed but its checkpoint could not be recorded
    CheckpointFailed { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::StepError { message } => write!(f, "step error: {}", message),
            FailureCause::Timeout { after_ms } => write!(f, "timed out after {}ms", after_ms),
            FailureCause::OperatorCancelled => f.write_str("OperatorCancelled"),
            FailureCause::CheckpointFailed { message } => {
                write!(f, "checkpoint failed: {}", message)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based position in the saga
    pub position: usize,
    pub name: String,
    pub state: StepState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub(crate) fn pending(position: usize, name: &str) -> Self {
        Self {
            position,
            name: name.to_string(),
            state: StepState::NotExecuted,
            started_at: None,
            finished_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaOutcome {
    Completed,
    Compensated,
    /// At least one compensation failed; an operator has to reconcile by hand
    PartiallyCompensated,
}

/// The step that made the saga fail and why
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailure {
    pub position: usize,
    pub step_name: String,
    pub cause: FailureCause,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaReport {
    pub saga_id: String,
    pub saga_name: String,
    pub outcome: SagaOutcome,
    pub failure: Option<SagaFailure>,
    pub steps: Vec<StepRecord>,
    /// Names of compensated steps in the order their compensations ran
    pub compensation_order: Vec<String>,
    pub duration_ms: u64,
}

impl SagaReport {
    pub fn is_success(&self) -> bool {
        self.outcome == SagaOutcome::Completed
    }

    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Steps whose compensation failed
    pub fn failed_compensations(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| matches!(s.state, StepState::CompensationFailed { .. }))
            .map(|s| s.name.clone())
            .collect()
    }

    /// `Ok` only for a completed saga
    pub fn into_result(self) -> Result<SagaReport, BridgeError> {
        match (self.outcome, &self.failure) {
            (SagaOutcome::Completed, _) => Ok(self),
            (SagaOutcome::PartiallyCompensated, _) => Err(BridgeError::PartiallyCompensated {
                saga: self.saga_name.clone(),
                failed_steps: self.failed_compensations(),
            }),
            (SagaOutcome::Compensated, Some(failure)) => Err(BridgeError::SagaFailed {
                saga: self.saga_name.clone(),
                step: failure.position,
                step_name: failure.step_name.clone(),
                cause: failure.cause.to_string(),
            }),
            (SagaOutcome::Compensated, None) => Err(BridgeError::SagaFailed {
                saga: self.saga_name.clone(),
                step: 0,
                step_name: String::new(),
                cause: "unknown".to_string(),
            }),
        }
    }
}
