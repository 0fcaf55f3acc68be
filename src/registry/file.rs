use async_trait::async_trait;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::info;

use super::store::{RegistryState, RegistryStore};
use crate::models::{
    AgentAssignment, AssignmentId, ExecutionId, IssueId, MappingStatus, WorkflowMapping,
    WorkflowResult,
};
use crate::persistence::{SnapshotFile, StoreError};

/// Registry persisted as a single JSON document.
///
/// Each write is applied to a copy of the state, saved, and only then made
/// visible, so a failed save leaves the in-memory view matching the file.
pub struct FileRegistryStore {
    state: Mutex<RegistryState>,
    file: SnapshotFile,
}

impl FileRegistryStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = SnapshotFile::open(path)?;
        let mut state: RegistryState = file.load().await?.unwrap_or_default();
        state.reindex();
        info!(
            path = %file.path().display(),
            mappings = state.mappings.len(),
            assignments = state.assignments.len(),
            "Opened file registry store"
        );
        Ok(Self {
            state: Mutex::new(state),
            file,
        })
    }

    async fn write<T>(
        &self,
        apply: impl FnOnce(&mut RegistryState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = apply(&mut next)?;
        self.file.save(&next).await?;
        *state = next;
        Ok(out)
    }
}

#[async_trait]
impl RegistryStore for FileRegistryStore {
    async fn snapshot_token(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.seq)
    }

    async fn insert_mapping(&self, mapping: WorkflowMapping) -> Result<WorkflowMapping, StoreError> {
        self.write(|s| Ok(s.insert_mapping(mapping))).await
    }

    async fn update_mapping(&self, mapping: &WorkflowMapping) -> Result<(), StoreError> {
        self.write(|s| s.update_mapping(mapping)).await
    }

    async fn get_mapping(&self, id: &ExecutionId) -> Result<Option<WorkflowMapping>, StoreError> {
        Ok(self.state.lock().await.mappings.get(id).cloned())
    }

    async fn find_by_issue(&self, issue_id: &IssueId) -> Result<Option<WorkflowMapping>, StoreError> {
        Ok(self.state.lock().await.find_by_issue(issue_id))
    }

    async fn list_mappings(
        &self,
        status: Option<MappingStatus>,
    ) -> Result<Vec<WorkflowMapping>, StoreError> {
        Ok(self.state.lock().await.list_mappings(status))
    }

    async fn insert_assignment(
        &self,
        assignment: AgentAssignment,
    ) -> Result<AgentAssignment, StoreError> {
        self.write(|s| Ok(s.insert_assignment(assignment))).await
    }

    async fn update_assignment(&self, assignment: &AgentAssignment) -> Result<(), StoreError> {
        self.write(|s| s.update_assignment(assignment)).await
    }

    async fn get_assignment(&self, id: AssignmentId) -> Result<Option<AgentAssignment>, StoreError> {
        Ok(self.state.lock().await.assignments.get(&id.0).cloned())
    }

    async fn list_assignments(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<AgentAssignment>, StoreError> {
        Ok(self.state.lock().await.list_assignments(execution_id))
    }

    async fn append_result(&self, result: WorkflowResult) -> Result<(), StoreError> {
        self.write(|s| {
            s.results.push(result);
            Ok(())
        })
        .await
    }

    async fn list_results(
        &self,
        execution_id: Option<&ExecutionId>,
    ) -> Result<Vec<WorkflowResult>, StoreError> {
        Ok(self.state.lock().await.list_results(execution_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentId, AssignmentStatus, WorkType};
    use crate::priority::Priority;
    use chrono::Utc;
    use tempfile::TempDir;

    fn mapping(issue: &str, exec: &str) -> WorkflowMapping {
        let now = Utc::now();
        WorkflowMapping {
            issue_id: IssueId::new(issue),
            execution_id: ExecutionId::new(exec),
            work_type: WorkType::Research,
            status: MappingStatus::Active,
            status_reason: None,
            priority: Priority::High,
            parent: None,
            metadata: serde_json::json!({"topic": "sqlx"}),
            seq: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        {
            let store = FileRegistryStore::open(&path).await.unwrap();
            let m = store.insert_mapping(mapping("bd-1", "wf-research-1")).await.unwrap();
            assert_eq!(m.seq, 1);
            let a = store
                .insert_assignment(AgentAssignment {
                    id: AssignmentId(0),
                    execution_id: m.execution_id.clone(),
                    agent_type: WorkType::Research,
                    agent_id: AgentId::new("research-01"),
                    step_number: 1,
                    step_name: "gather".to_string(),
                    status: AssignmentStatus::Started,
                    attempt: 1,
                    handoff_from: None,
                    handoff_to: None,
                    assigned_at: Utc::now(),
                    started_at: Some(Utc::now()),
                    completed_at: None,
                })
                .await
                .unwrap();
            assert_eq!(a.id, AssignmentId(1));
        }

        let reopened = FileRegistryStore::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot_token().await.unwrap(), 1);
        let found = reopened
            .find_by_issue(&IssueId::new("bd-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.metadata["topic"], "sqlx");
        let assignments = reopened.list_assignments(&found.execution_id).await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].status, AssignmentStatus::Started);
    }

    #[tokio::test]
    async fn test_update_of_unknown_mapping_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FileRegistryStore::open(dir.path().join("r.json")).await.unwrap();
        let err = store
            .update_mapping(&mapping("bd-9", "wf-research-9"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.list_mappings(None).await.unwrap().is_empty());
    }
}
