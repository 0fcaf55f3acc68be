use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use crate::models::{AgentId, AgentType, AssignmentId, ExecutionId};

/// Signal types the router knows about; anything else travels as `Custom`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalKind {
    AgentHandoff,
    StepCompleted,
    StepFailed,
    RecoveryCompleted,
    WorkflowStarted,
    WorkflowCancelled,
    Custom(String),
}

impl SignalKind {
    pub fn as_str(&self) -> &str {
        match self {
            SignalKind::AgentHandoff => "agent_handoff",
            SignalKind::StepCompleted => "step_completed",
            SignalKind::StepFailed => "step_failed",
            SignalKind::RecoveryCompleted => "recovery_completed",
            SignalKind::WorkflowStarted => "workflow_started",
            SignalKind::WorkflowCancelled => "workflow_cancelled",
            SignalKind::Custom(name) => name,
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        SignalKind::from(name.into())
    }
}

impl From<String> for SignalKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "agent_handoff" => SignalKind::AgentHandoff,
            "step_completed" => SignalKind::StepCompleted,
            "step_failed" => SignalKind::StepFailed,
            "recovery_completed" => SignalKind::RecoveryCompleted,
            "workflow_started" => SignalKind::WorkflowStarted,
            "workflow_cancelled" => SignalKind::WorkflowCancelled,
            _ => SignalKind::Custom(value),
        }
    }
}

impl From<SignalKind> for String {
    fn from(kind: SignalKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a signal is in its delivery lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivering { attempts: u32 },
    Handled { attempts: u32 },
    DeadLettered { attempts: u32, error: String },
}

impl DeliveryState {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DeliveryState::Handled { .. } | DeliveryState::DeadLettered { .. }
        )
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Delivering { attempts }
            | DeliveryState::Handled { attempts }
            | DeliveryState::DeadLettered { attempts, .. } => *attempts,
        }
    }

    pub fn status_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivering { .. } => "delivering",
            DeliveryState::Handled { .. } => "handled",
            DeliveryState::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// A durably recorded signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Log-allocated, increasing in emission order
    pub id: u64,
    pub execution_id: ExecutionId,
    pub kind: SignalKind,
    pub payload: serde_json::Value,
    pub state: DeliveryState,
    pub emitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Signal {
    pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            anyhow::anyhow!("signal {} ({}) has malformed payload: {}", self.id, self.kind, e)
        })
    }
}

/// Payload of `agent_handoff`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffPayload {
    pub from_assignment: AssignmentId,
    pub from_agent: AgentId,
    pub to_agent: AgentId,
    pub to_agent_type: AgentType,
    /// Step the receiving agent takes over; the handoff is keyed on it
    pub step_number: u32,
    pub step_name: String,
}

/// Payload of `step_completed` and `step_failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub step_number: u32,
    pub step_name: String,
    pub agent_id: Option<AgentId>,
    pub error: Option<String>,
}

/// Payload of `recovery_completed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPayload {
    pub outcome: String,
    pub checkpoint_step: Option<u32>,
    pub reassigned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_string_form() {
        assert_eq!(SignalKind::from("agent_handoff".to_string()), SignalKind::AgentHandoff);
        assert_eq!(
            SignalKind::custom("review_requested"),
            SignalKind::Custom("review_requested".into())
        );
        let json = serde_json::to_string(&SignalKind::RecoveryCompleted).unwrap();
        assert_eq!(json, "\"recovery_completed\"");
    }

    #[test]
    fn test_delivery_state() {
        assert!(!DeliveryState::Pending.is_settled());
        assert!(!DeliveryState::Delivering { attempts: 2 }.is_settled());
        assert!(DeliveryState::Handled { attempts: 1 }.is_settled());
        let dead = DeliveryState::DeadLettered {
            attempts: 3,
            error: "boom".into(),
        };
        assert!(dead.is_settled());
        assert_eq!(dead.attempts(), 3);
        assert_eq!(dead.status_str(), "dead_lettered");
    }

    #[test]
    fn test_decode_payload() {
        let now = Utc::now();
        let signal = Signal {
            id: 1,
            execution_id: ExecutionId::new("wf-1"),
            kind: SignalKind::StepFailed,
            payload: serde_json::json!({"step_number": 2, "step_name": "run-tests", "agent_id": null, "error": "exit 1"}),
            state: DeliveryState::Pending,
            emitted_at: now,
            updated_at: now,
        };
        let payload: StepPayload = signal.decode().unwrap();
        assert_eq!(payload.step_number, 2);
        assert_eq!(payload.error.as_deref(), Some("exit 1"));
        assert!(signal.decode::<HandoffPayload>().is_err());
    }
}
