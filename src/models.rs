use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::priority::Priority;

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Identifier assigned to an issue by the ticketing store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(String);

impl IssueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IssueId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of an execution in the workflow engine. Also the key of its mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `wf-<work type>-<8 hex chars>`
    pub fn generate(work_type: WorkType) -> Self {
        Self(format!("wf-{}-{}", work_type, short_uuid()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a running agent instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<agent type>-agent-<8 hex chars>`
    pub fn generate(agent_type: AgentType) -> Self {
        Self(format!("{}-agent-{}", agent_type, short_uuid()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Store-allocated assignment identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssignmentId(pub u64);

impl fmt::Display for AssignmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of work a mapping represents. Agent types share the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Research,
    Poc,
    Documentation,
    Validation,
    Supervisor,
}

pub type AgentType = WorkType;

impl WorkType {
    pub const ALL: [WorkType; 5] = [
        WorkType::Research,
        WorkType::Poc,
        WorkType::Documentation,
        WorkType::Validation,
        WorkType::Supervisor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Research => "research",
            WorkType::Poc => "poc",
            WorkType::Documentation => "documentation",
            WorkType::Validation => "validation",
            WorkType::Supervisor => "supervisor",
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(WorkType::Research),
            "poc" | "proof-of-concept" => Ok(WorkType::Poc),
            "documentation" => Ok(WorkType::Documentation),
            "validation" => Ok(WorkType::Validation),
            "supervisor" => Ok(WorkType::Supervisor),
            other => Err(BridgeError::Config(format!("unknown work type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Active,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl MappingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MappingStatus::Completed | MappingStatus::Failed | MappingStatus::Cancelled
        )
    }

    /// Terminal statuses never change; reopening creates a new mapping.
    pub fn can_transition_to(self, next: MappingStatus) -> bool {
        use MappingStatus::*;
        match (self, next) {
            (Active, Paused) | (Paused, Active) => true,
            (Active | Paused, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::Active => "active",
            MappingStatus::Completed => "completed",
            MappingStatus::Failed => "failed",
            MappingStatus::Paused => "paused",
            MappingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MappingStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MappingStatus::Active),
            "completed" => Ok(MappingStatus::Completed),
            "failed" => Ok(MappingStatus::Failed),
            "paused" => Ok(MappingStatus::Paused),
            "cancelled" => Ok(MappingStatus::Cancelled),
            other => Err(BridgeError::Config(format!("unknown mapping status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Started,
    Completed,
    Failed,
    Cancelled,
}

impl AssignmentStatus {
    /// Assigned and started assignments hold the mapping's single active slot.
    pub fn is_active(self) -> bool {
        matches!(self, AssignmentStatus::Assigned | AssignmentStatus::Started)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Assigned, Started)
                | (Assigned, Cancelled)
                | (Started, Completed)
                | (Started, Failed)
                | (Started, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Started => "started",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Failed => "failed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "started" => Ok(AssignmentStatus::Started),
            "completed" => Ok(AssignmentStatus::Completed),
            "failed" => Ok(AssignmentStatus::Failed),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            other => Err(BridgeError::Config(format!(
                "unknown assignment status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Findings,
    PocResults,
    Documentation,
    Validation,
    Performance,
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResultType::Findings => "findings",
            ResultType::PocResults => "poc_results",
            ResultType::Documentation => "documentation",
            ResultType::Validation => "validation",
            ResultType::Performance => "performance",
        };
        f.write_str(label)
    }
}

/// The coordination record binding one issue to one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMapping {
    pub issue_id: IssueId,
    pub execution_id: ExecutionId,
    pub work_type: WorkType,
    pub status: MappingStatus,
    /// Why the mapping reached its current status, e.g. `NoCheckpoint`
    pub status_reason: Option<String>,
    pub priority: Priority,
    pub parent: Option<ExecutionId>,
    pub metadata: serde_json::Value,
    /// Store-allocated sequence number, compared against snapshot tokens
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input to `Registry::create_mapping`
#[derive(Debug, Clone)]
pub struct NewMapping {
    pub issue_id: IssueId,
    pub execution_id: ExecutionId,
    pub work_type: WorkType,
    pub priority: Priority,
    pub parent: Option<ExecutionId>,
    pub metadata: serde_json::Value,
}

impl NewMapping {
    pub fn new(issue_id: IssueId, execution_id: ExecutionId, work_type: WorkType) -> Self {
        Self {
            issue_id,
            execution_id,
            work_type,
            priority: Priority::default(),
            parent: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent: ExecutionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// One agent's ownership window over one step of a mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAssignment {
    pub id: AssignmentId,
    pub execution_id: ExecutionId,
    pub agent_type: AgentType,
    pub agent_id: AgentId,
    pub step_number: u32,
    pub step_name: String,
    pub status: AssignmentStatus,
    /// 1 for a fresh step, incremented each time recovery re-issues it
    pub attempt: u32,
    pub handoff_from: Option<AgentId>,
    pub handoff_to: Option<AgentId>,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentAssignment {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// What an agent is asking to own
#[derive(Debug, Clone)]
pub struct AssignRequest {
    pub agent_type: AgentType,
    pub agent_id: AgentId,
    pub step_name: String,
    pub handoff_from: Option<AgentId>,
}

impl AssignRequest {
    pub fn new(agent_type: AgentType, agent_id: AgentId, step_name: impl Into<String>) -> Self {
        Self {
            agent_type,
            agent_id,
            step_name: step_name.into(),
            handoff_from: None,
        }
    }

    /// Request with a freshly generated agent instance id
    pub fn for_type(agent_type: AgentType, step_name: impl Into<String>) -> Self {
        Self::new(agent_type, AgentId::generate(agent_type), step_name)
    }

    pub fn handoff_from(mut self, agent: AgentId) -> Self {
        self.handoff_from = Some(agent);
        self
    }
}

/// Immutable record of what an agent produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub execution_id: ExecutionId,
    pub agent_type: AgentType,
    pub result_type: ResultType,
    pub payload: serde_json::Value,
    pub confidence: Option<f64>,
    pub quality_score: Option<f64>,
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub resource_usage: Option<serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl WorkflowResult {
    pub fn new(
        execution_id: ExecutionId,
        agent_type: AgentType,
        result_type: ResultType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            execution_id,
            agent_type,
            result_type,
            payload,
            confidence: None,
            quality_score: None,
            duration_ms: None,
            artifacts: Vec::new(),
            resource_usage: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_quality_score(mut self, quality: f64) -> Self {
        self.quality_score = Some(quality);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_resource_usage(mut self, usage: serde_json::Value) -> Self {
        self.resource_usage = Some(usage);
        self
    }

    /// Scores, when present, must lie in [0, 1]. NaN is rejected.
    pub fn validate(&self) -> Result<(), BridgeError> {
        for (field, value) in [
            ("confidence", self.confidence),
            ("quality_score", self.quality_score),
        ] {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(BridgeError::ScoreOutOfRange { field, value: v });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_follow_naming_scheme() {
        let exec = ExecutionId::generate(WorkType::Research);
        assert!(exec.as_str().starts_with("wf-research-"));
        assert_eq!(exec.as_str().len(), "wf-research-".len() + 8);

        let agent = AgentId::generate(WorkType::Poc);
        assert!(agent.as_str().starts_with("poc-agent-"));
        assert_ne!(AgentId::generate(WorkType::Poc), agent);
    }

    #[test]
    fn test_assignment_transitions_are_forward_only() {
        use AssignmentStatus::*;
        assert!(Assigned.can_transition_to(Started));
        assert!(Started.can_transition_to(Completed));
        assert!(Started.can_transition_to(Failed));
        assert!(Assigned.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Started));
        assert!(!Started.can_transition_to(Assigned));
        assert!(!Assigned.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Cancelled));
    }

    #[test]
    fn test_terminal_mapping_status_is_sticky() {
        use MappingStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Cancelled));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Active, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_result_score_validation() {
        let base = WorkflowResult::new(
            ExecutionId::new("wf-research-1"),
            WorkType::Research,
            ResultType::Findings,
            serde_json::json!({"summary": "ok"}),
        );
        assert!(base.clone().with_confidence(0.0).validate().is_ok());
        assert!(base.clone().with_confidence(1.0).validate().is_ok());
        assert!(base.clone().with_confidence(1.01).validate().is_err());
        assert!(base.clone().with_confidence(f64::NAN).validate().is_err());
        assert!(matches!(
            base.with_quality_score(-0.2).validate(),
            Err(BridgeError::ScoreOutOfRange { field: "quality_score", .. })
        ));
    }

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            MappingStatus::Active,
            MappingStatus::Paused,
            MappingStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<MappingStatus>().unwrap(), status);
        }
        assert_eq!("proof-of-concept".parse::<WorkType>().unwrap(), WorkType::Poc);
        assert!("marketing".parse::<WorkType>().is_err());
    }
}
