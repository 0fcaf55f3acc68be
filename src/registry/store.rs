//! Storage seam for mappings, assignments and results
//!
//! Stores are dumb: they persist records and allocate identifiers. Every
//! invariant (single active owner, step ordering, status transitions) is
//! enforced by the `Registry` under its per-mapping locks before a store
//! method is called.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::models::{
    AgentAssignment, AssignmentId, ExecutionId, IssueId, MappingStatus, WorkflowMapping,
    WorkflowResult,
};
use crate::persistence::StoreError;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Highest sequence number handed out so far
    async fn snapshot_token(&self) -> Result<u64, StoreError>;

    /// Persist a new mapping; `seq` is allocated by the store
    async fn insert_mapping(&self, mapping: WorkflowMapping) -> Result<WorkflowMapping, StoreError>;

    async fn update_mapping(&self, mapping: &WorkflowMapping) -> Result<(), StoreError>;

    async fn get_mapping(&self, id: &ExecutionId) -> Result<Option<WorkflowMapping>, StoreError>;

    async fn find_by_issue(&self, issue_id: &IssueId) -> Result<Option<WorkflowMapping>, StoreError>;

    /// All mappings, or only those in `status`, ordered by `seq`
    async fn list_mappings(
        &self,
        status: Option<MappingStatus>,
    ) -> Result<Vec<WorkflowMapping>, StoreError>;

    /// Persist a new assignment; `id` is allocated by the store
    async fn insert_assignment(
        &self,
        assignment: AgentAssignment,
    ) -> Result<AgentAssignment, StoreError>;

    async fn update_assignment(&self, assignment: &AgentAssignment) -> Result<(), StoreError>;

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<AgentAssignment>, StoreError>;

    /// Assignments of one mapping ordered by id
    async fn list_assignments(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<AgentAssignment>, StoreError>;

    async fn append_result(&self, result: WorkflowResult) -> Result<(), StoreError>;

    async fn list_results(
        &self,
        execution_id: Option<&ExecutionId>,
    ) -> Result<Vec<WorkflowResult>, StoreError>;
}

/// Serializable registry contents shared by the memory and file backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryState {
    pub seq: u64,
    pub next_assignment_id: u64,
    pub mappings: BTreeMap<ExecutionId, WorkflowMapping>,
    pub assignments: BTreeMap<u64, AgentAssignment>,
    pub results: Vec<WorkflowResult>,
    #[serde(skip)]
    issue_index: HashMap<IssueId, ExecutionId>,
}

impl RegistryState {
    /// Rebuild derived indexes after deserializing
    pub fn reindex(&mut self) {
        self.issue_index = self
            .mappings
            .values()
            .map(|m| (m.issue_id.clone(), m.execution_id.clone()))
            .collect();
    }

    pub fn insert_mapping(&mut self, mut mapping: WorkflowMapping) -> WorkflowMapping {
        self.seq += 1;
        mapping.seq = self.seq;
        self.issue_index
            .insert(mapping.issue_id.clone(), mapping.execution_id.clone());
        self.mappings
            .insert(mapping.execution_id.clone(), mapping.clone());
        mapping
    }

    pub fn update_mapping(&mut self, mapping: &WorkflowMapping) -> Result<(), StoreError> {
        let slot = self
            .mappings
            .get_mut(&mapping.execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("mapping {}", mapping.execution_id)))?;
        *slot = mapping.clone();
        Ok(())
    }

    pub fn find_by_issue(&self, issue_id: &IssueId) -> Option<WorkflowMapping> {
        self.issue_index
            .get(issue_id)
            .and_then(|id| self.mappings.get(id))
            .cloned()
    }

    pub fn list_mappings(&self, status: Option<MappingStatus>) -> Vec<WorkflowMapping> {
        let mut mappings: Vec<_> = self
            .mappings
            .values()
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        mappings.sort_by_key(|m| m.seq);
        mappings
    }

    pub fn insert_assignment(&mut self, mut assignment: AgentAssignment) -> AgentAssignment {
        self.next_assignment_id += 1;
        assignment.id = AssignmentId(self.next_assignment_id);
        self.assignments
            .insert(self.next_assignment_id, assignment.clone());
        assignment
    }

    pub fn update_assignment(&mut self, assignment: &AgentAssignment) -> Result<(), StoreError> {
        let slot = self
            .assignments
            .get_mut(&assignment.id.0)
            .ok_or_else(|| StoreError::NotFound(format!("assignment {}", assignment.id)))?;
        *slot = assignment.clone();
        Ok(())
    }

    pub fn list_assignments(&self, execution_id: &ExecutionId) -> Vec<AgentAssignment> {
        self.assignments
            .values()
            .filter(|a| &a.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub fn list_results(&self, execution_id: Option<&ExecutionId>) -> Vec<WorkflowResult> {
        self.results
            .iter()
            .filter(|r| execution_id.map_or(true, |id| &r.execution_id == id))
            .cloned()
            .collect()
    }
}

/// Volatile store for tests and embedding
#[derive(Default)]
pub struct MemoryRegistryStore {
    state: Mutex<RegistryState>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn snapshot_token(&self) -> Result<u64, StoreError> {
        Ok(self.state().seq)
    }

    async fn insert_mapping(&self, mapping: WorkflowMapping) -> Result<WorkflowMapping, StoreError> {
        Ok(self.state().insert_mapping(mapping))
    }

    async fn update_mapping(&self, mapping: &WorkflowMapping) -> Result<(), StoreError> {
        self.state().update_mapping(mapping)
    }

    async fn get_mapping(&self, id: &ExecutionId) -> Result<Option<WorkflowMapping>, StoreError> {
        Ok(self.state().mappings.get(id).cloned())
    }

    async fn find_by_issue(&self, issue_id: &IssueId) -> Result<Option<WorkflowMapping>, StoreError> {
        Ok(self.state().find_by_issue(issue_id))
    }

    async fn list_mappings(
        &self,
        status: Option<MappingStatus>,
    ) -> Result<Vec<WorkflowMapping>, StoreError> {
        Ok(self.state().list_mappings(status))
    }

    async fn insert_assignment(
        &self,
        assignment: AgentAssignment,
    ) -> Result<AgentAssignment, StoreError> {
        Ok(self.state().insert_assignment(assignment))
    }

    async fn update_assignment(&self, assignment: &AgentAssignment) -> Result<(), StoreError> {
        self.state().update_assignment(assignment)
    }

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<AgentAssignment>, StoreError> {
        Ok(self.state().assignments.get(&id.0).cloned())
    }

    async fn list_assignments(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<AgentAssignment>, StoreError> {
        Ok(self.state().list_assignments(execution_id))
    }

    async fn append_result(&self, result: WorkflowResult) -> Result<(), StoreError> {
        self.state().results.push(result);
        Ok(())
    }

    async fn list_results(
        &self,
        execution_id: Option<&ExecutionId>,
    ) -> Result<Vec<WorkflowResult>, StoreError> {
        Ok(self.state().list_results(execution_id))
    }
}
