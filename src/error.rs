use thiserror::Error;

use crate::external::{EngineError, TicketingError};
use crate::models::{AssignmentId, ExecutionId, IssueId, MappingStatus};
use crate::persistence::StoreError;

/// Errors surfaced by the coordination bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Issue {0} already has a workflow mapping")]
    AlreadyMapped(IssueId),

    #[error("Execution id {0} is already used by another mapping")]
    ExecutionIdInUse(ExecutionId),

    #[error("Invalid parent mapping {parent}: {reason}")]
    InvalidParent { parent: ExecutionId, reason: String },

    #[error("Mapping {execution_id} is not active (status: {status})")]
    MappingNotActive {
        execution_id: ExecutionId,
        status: MappingStatus,
    },

    #[error("Mapping {execution_id} already has an active owner (assignment {holder})")]
    OwnershipConflict {
        execution_id: ExecutionId,
        holder: AssignmentId,
    },

    #[error("Mapping {0} already has a saga in flight")]
    SagaInFlight(ExecutionId),

    #[error("Timed out after {waited_ms}ms waiting for mapping {execution_id} to become free")]
    AssignTimeout {
        execution_id: ExecutionId,
        waited_ms: u64,
    },

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Step {requested} is out of order for mapping {execution_id} (next step is {expected})")]
    StepOutOfOrder {
        execution_id: ExecutionId,
        expected: u32,
        requested: u32,
    },

    #[error("No checkpoint recorded for execution {0}")]
    NoCheckpoint(ExecutionId),

    #[error("Saga {saga} failed at step {step} ({step_name}) and was compensated: {cause}")]
    SagaFailed {
        saga: String,
        step: usize,
        step_name: String,
        cause: String,
    },

    #[error("Compensation of step {step_name} in saga {saga} failed: {reason}")]
    CompensationFailed {
        saga: String,
        step_name: String,
        reason: String,
    },

    #[error("Saga {saga} is partially compensated, manual intervention required for: {}", .failed_steps.join(", "))]
    PartiallyCompensated {
        saga: String,
        failed_steps: Vec<String>,
    },

    #[error("Recovery aborted: {reason}")]
    RecoveryAborted { reason: String },

    #[error("Mapping {0} not found")]
    MappingNotFound(ExecutionId),

    #[error("No mapping exists for issue {0}")]
    IssueNotMapped(IssueId),

    #[error("Assignment {0} not found")]
    AssignmentNotFound(AssignmentId),

    #[error("{field} must lie in [0.0, 1.0], got {value}")]
    ScoreOutOfRange { field: &'static str, value: f64 },

    #[error("Priority must be between 0 and 3, got {0}")]
    InvalidPriority(u8),

    #[error("Bridge is not accepting work (state: {state})")]
    NotServing { state: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Ticketing store error: {0}")]
    Ticketing(#[from] TicketingError),

    #[error("Execution engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Invariant violations are returned to the caller and never retried.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            BridgeError::AlreadyMapped(_)
                | BridgeError::ExecutionIdInUse(_)
                | BridgeError::InvalidParent { .. }
                | BridgeError::OwnershipConflict { .. }
                | BridgeError::SagaInFlight(_)
                | BridgeError::InvalidTransition { .. }
                | BridgeError::StepOutOfOrder { .. }
        )
    }

    /// Errors that need an operator before the affected mapping can make progress
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            BridgeError::PartiallyCompensated { .. }
                | BridgeError::CompensationFailed { .. }
                | BridgeError::RecoveryAborted { .. }
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_violations_are_classified() {
        let conflict = BridgeError::OwnershipConflict {
            execution_id: ExecutionId::new("wf-research-1"),
            holder: AssignmentId(7),
        };
        assert!(conflict.is_invariant_violation());
        assert!(!conflict.requires_operator());

        let partial = BridgeError::PartiallyCompensated {
            saga: "poc".to_string(),
            failed_steps: vec!["create-impl".to_string()],
        };
        assert!(partial.requires_operator());
        assert!(!partial.is_invariant_violation());
        assert!(partial.to_string().contains("create-impl"));
    }

    #[test]
    fn test_not_found_is_not_invariant_violation() {
        let err = BridgeError::MappingNotFound(ExecutionId::new("wf-poc-2"));
        assert!(!err.is_invariant_violation());
        assert_eq!(err.to_string(), "Mapping wf-poc-2 not found");
    }
}
