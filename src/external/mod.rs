//! Narrow interfaces to the collaborators the bridge coordinates
//!
//! The ticketing store and the execution engine are owned by other systems.
//! The bridge only needs the handful of calls declared here, which keeps both
//! swappable for in-memory doubles in tests.

pub mod beads;
pub mod command;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{ExecutionId, IssueId, MappingStatus, WorkType};
use crate::priority::Priority;

pub use beads::BeadsCliTicketing;
pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
pub use memory::{InMemoryEngine, InMemoryTicketing};

/// Signal types the bridge sends to the execution engine
pub mod engine_signals {
    /// Payload `{"step_number": n, "state": {...}}`; the engine checkpoints it
    pub const STEP_COMMITTED: &str = "step_committed";
    pub const EXECUTION_COMPLETED: &str = "execution_completed";
    pub const EXECUTION_FAILED: &str = "execution_failed";
    pub const EXECUTION_CANCELLED: &str = "execution_cancelled";
    pub const AGENT_HANDOFF: &str = "agent_handoff";
}

#[derive(Debug, Error)]
pub enum TicketingError {
    #[error("Ticketing store unavailable: {0}")]
    Unavailable(String),
    #[error("Issue {0} not found")]
    IssueNotFound(IssueId),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("Unexpected response from ticketing store: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Execution engine unavailable: {0}")]
    Unavailable(String),
    #[error("Execution {0} not found")]
    ExecutionNotFound(ExecutionId),
    #[error("Execution {0} already started")]
    AlreadyStarted(ExecutionId),
    #[error("Execution engine rejected request: {0}")]
    Rejected(String),
}

/// Issue status vocabulary of the ticketing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    Cancelled,
}

impl IssueStatus {
    /// Ticket status that mirrors a mapping status
    pub fn for_mapping(status: MappingStatus) -> Self {
        match status {
            MappingStatus::Active => IssueStatus::InProgress,
            MappingStatus::Completed => IssueStatus::Closed,
            MappingStatus::Failed | MappingStatus::Paused => IssueStatus::Blocked,
            MappingStatus::Cancelled => IssueStatus::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Closed => "closed",
            IssueStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IssueStatus::Open),
            "in_progress" => Some(IssueStatus::InProgress),
            "blocked" => Some(IssueStatus::Blocked),
            "closed" => Some(IssueStatus::Closed),
            "cancelled" => Some(IssueStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateIssueRequest {
    pub title: String,
    pub description: Option<String>,
    pub work_type: WorkType,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub metadata: serde_json::Value,
    /// Retrying a create with the same key returns the issue created the first time
    pub idempotency_key: String,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait TicketingStore: Send + Sync {
    async fn create_issue(&self, request: &CreateIssueRequest) -> Result<IssueId, TicketingError>;

    async fn update_issue_status(
        &self,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> Result<(), TicketingError>;

    async fn add_comment(&self, issue_id: &IssueId, text: &str) -> Result<(), TicketingError>;

    async fn issue_status(&self, issue_id: &IssueId) -> Result<IssueStatus, TicketingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl CheckpointStatus {
    /// The mapping status a checkpoint in this state implies
    pub fn mapping_status(self) -> MappingStatus {
        match self {
            CheckpointStatus::Running => MappingStatus::Active,
            CheckpointStatus::Completed => MappingStatus::Completed,
            CheckpointStatus::Failed => MappingStatus::Failed,
            CheckpointStatus::Cancelled => MappingStatus::Cancelled,
        }
    }
}

/// Durable snapshot of execution-engine state for one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: ExecutionId,
    /// Last mapping step durably committed, 0 before the first step
    pub step_number: u32,
    pub status: CheckpointStatus,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn start_execution(
        &self,
        execution_id: &ExecutionId,
        definition: &str,
        context: serde_json::Value,
    ) -> Result<(), EngineError>;

    async fn signal(
        &self,
        execution_id: &ExecutionId,
        signal_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError>;

    /// `Ok(None)` means the execution never checkpointed
    async fn get_checkpoint(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Checkpoint>, EngineError>;

    async fn restore_from_checkpoint(
        &self,
        execution_id: &ExecutionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), EngineError>;
}
