//! In-process ticketing store and execution engine
//!
//! Both keep their state behind a mutex and can be told to fail, which lets
//! tests drive outage and crash scenarios. Sharing one instance through an
//! `Arc` across two bridge instances models a process restart: the external
//! systems survive, the bridge's in-memory state does not.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{
    engine_signals, Checkpoint, CheckpointStatus, CreateIssueRequest, EngineError,
    ExecutionEngine, IssueStatus, TicketingError, TicketingStore,
};
use crate::models::{ExecutionId, IssueId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct StoredIssue {
    pub id: IssueId,
    pub title: String,
    pub description: Option<String>,
    pub status: IssueStatus,
    pub labels: Vec<String>,
    pub comments: Vec<String>,
}

#[derive(Default)]
struct TicketingState {
    issues: BTreeMap<IssueId, StoredIssue>,
    by_key: HashMap<String, IssueId>,
    next_id: u64,
}

#[derive(Default)]
pub struct InMemoryTicketing {
    state: Mutex<TicketingState>,
    unavailable: AtomicBool,
}

impl InMemoryTicketing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn issue(&self, id: &IssueId) -> Option<StoredIssue> {
        lock(&self.state).issues.get(id).cloned()
    }

    pub fn comments(&self, id: &IssueId) -> Vec<String> {
        self.issue(id).map(|i| i.comments).unwrap_or_default()
    }

    pub fn issue_count(&self) -> usize {
        lock(&self.state).issues.len()
    }

    fn check_available(&self) -> Result<(), TicketingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TicketingError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketingStore for InMemoryTicketing {
    async fn create_issue(&self, request: &CreateIssueRequest) -> Result<IssueId, TicketingError> {
        self.check_available()?;
        let mut state = lock(&self.state);
        if let Some(existing) = state.by_key.get(&request.idempotency_key) {
            debug!(issue_id = %existing, key = %request.idempotency_key, "Idempotent issue create");
            return Ok(existing.clone());
        }
        state.next_id += 1;
        let id = IssueId::new(format!("bd-{}", state.next_id));
        state.issues.insert(
            id.clone(),
            StoredIssue {
                id: id.clone(),
                title: request.title.clone(),
                description: request.description.clone(),
                status: IssueStatus::Open,
                labels: request.labels.clone(),
                comments: Vec::new(),
            },
        );
        state
            .by_key
            .insert(request.idempotency_key.clone(), id.clone());
        Ok(id)
    }

    async fn update_issue_status(
        &self,
        issue_id: &IssueId,
        status: IssueStatus,
    ) -> Result<(), TicketingError> {
        self.check_available()?;
        let mut state = lock(&self.state);
        let issue = state
            .issues
            .get_mut(issue_id)
            .ok_or_else(|| TicketingError::IssueNotFound(issue_id.clone()))?;
        issue.status = status;
        Ok(())
    }

    async fn add_comment(&self, issue_id: &IssueId, text: &str) -> Result<(), TicketingError> {
        self.check_available()?;
        let mut state = lock(&self.state);
        let issue = state
            .issues
            .get_mut(issue_id)
            .ok_or_else(|| TicketingError::IssueNotFound(issue_id.clone()))?;
        issue.comments.push(text.to_string());
        Ok(())
    }

    async fn issue_status(&self, issue_id: &IssueId) -> Result<IssueStatus, TicketingError> {
        self.check_available()?;
        lock(&self.state)
            .issues
            .get(issue_id)
            .map(|i| i.status)
            .ok_or_else(|| TicketingError::IssueNotFound(issue_id.clone()))
    }
}

#[derive(Debug, Clone)]
struct ExecutionRecord {
    definition: String,
    checkpoint: Option<Checkpoint>,
    signals: Vec<(String, serde_json::Value)>,
    restores: u32,
}

#[derive(Default)]
pub struct InMemoryEngine {
    executions: Mutex<HashMap<ExecutionId, ExecutionRecord>>,
    unavailable: AtomicBool,
    failing_signals: Mutex<HashSet<String>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `Unavailable` while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `signal` calls of this type fail until cleared
    pub fn fail_signal(&self, signal_type: &str) {
        lock(&self.failing_signals).insert(signal_type.to_string());
    }

    pub fn clear_signal_failures(&self) {
        lock(&self.failing_signals).clear();
    }

    /// Drop the checkpoint as if the engine never persisted it
    pub fn forget_checkpoint(&self, execution_id: &ExecutionId) {
        if let Some(record) = lock(&self.executions).get_mut(execution_id) {
            record.checkpoint = None;
        }
    }

    pub fn checkpoint(&self, execution_id: &ExecutionId) -> Option<Checkpoint> {
        lock(&self.executions)
            .get(execution_id)
            .and_then(|r| r.checkpoint.clone())
    }

    pub fn definition(&self, execution_id: &ExecutionId) -> Option<String> {
        lock(&self.executions)
            .get(execution_id)
            .map(|r| r.definition.clone())
    }

    /// Signal types received for an execution, in arrival order
    pub fn signals(&self, execution_id: &ExecutionId) -> Vec<String> {
        lock(&self.executions)
            .get(execution_id)
            .map(|r| r.signals.iter().map(|(kind, _)| kind.clone()).collect())
            .unwrap_or_default()
    }

    pub fn signal_payloads(&self, execution_id: &ExecutionId, signal_type: &str) -> Vec<serde_json::Value> {
        lock(&self.executions)
            .get(execution_id)
            .map(|r| {
                r.signals
                    .iter()
                    .filter(|(kind, _)| kind == signal_type)
                    .map(|(_, payload)| payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn restore_count(&self, execution_id: &ExecutionId) -> u32 {
        lock(&self.executions)
            .get(execution_id)
            .map(|r| r.restores)
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionEngine for InMemoryEngine {
    async fn start_execution(
        &self,
        execution_id: &ExecutionId,
        definition: &str,
        context: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.check_available()?;
        let mut executions = lock(&self.executions);
        if executions.contains_key(execution_id) {
            return Err(EngineError::AlreadyStarted(execution_id.clone()));
        }
        executions.insert(
            execution_id.clone(),
            ExecutionRecord {
                definition: definition.to_string(),
                checkpoint: Some(Checkpoint {
                    execution_id: execution_id.clone(),
                    step_number: 0,
                    status: CheckpointStatus::Running,
                    state: context,
                    created_at: Utc::now(),
                }),
                signals: Vec::new(),
                restores: 0,
            },
        );
        Ok(())
    }

    async fn signal(
        &self,
        execution_id: &ExecutionId,
        signal_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.check_available()?;
        if lock(&self.failing_signals).contains(signal_type) {
            return Err(EngineError::Unavailable(format!(
                "injected failure for signal {}",
                signal_type
            )));
        }
        let mut executions = lock(&self.executions);
        let record = executions
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.clone()))?;

        let previous_step = record.checkpoint.as_ref().map(|c| c.step_number).unwrap_or(0);
        let previous_state = record
            .checkpoint
            .as_ref()
            .map(|c| c.state.clone())
            .unwrap_or(serde_json::Value::Null);
        let next = match signal_type {
            engine_signals::STEP_COMMITTED => {
                let step = payload
                    .get("step_number")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| EngineError::Rejected("step_committed without step_number".to_string()))?;
                Some((step as u32, CheckpointStatus::Running))
            }
            engine_signals::EXECUTION_COMPLETED => Some((previous_step, CheckpointStatus::Completed)),
            engine_signals::EXECUTION_FAILED => Some((previous_step, CheckpointStatus::Failed)),
            engine_signals::EXECUTION_CANCELLED => Some((previous_step, CheckpointStatus::Cancelled)),
            _ => None,
        };
        if let Some((step_number, status)) = next {
            record.checkpoint = Some(Checkpoint {
                execution_id: execution_id.clone(),
                step_number,
                status,
                state: payload.get("state").cloned().unwrap_or(previous_state),
                created_at: Utc::now(),
            });
        }
        record.signals.push((signal_type.to_string(), payload));
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Checkpoint>, EngineError> {
        self.check_available()?;
        Ok(self.checkpoint(execution_id))
    }

    async fn restore_from_checkpoint(
        &self,
        execution_id: &ExecutionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), EngineError> {
        self.check_available()?;
        let mut executions = lock(&self.executions);
        let record = executions
            .get_mut(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.clone()))?;
        record.checkpoint = Some(checkpoint.clone());
        record.restores += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkType;
    use crate::priority::Priority;

    fn request(key: &str) -> CreateIssueRequest {
        CreateIssueRequest {
            title: "Research tokio internals".to_string(),
            description: None,
            work_type: WorkType::Research,
            priority: Priority::High,
            labels: vec!["research".to_string()],
            metadata: serde_json::Value::Null,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_issue_is_idempotent_by_key() {
        let ticketing = InMemoryTicketing::new();
        let first = ticketing.create_issue(&request("k1")).await.unwrap();
        let retry = ticketing.create_issue(&request("k1")).await.unwrap();
        let other = ticketing.create_issue(&request("k2")).await.unwrap();
        assert_eq!(first, retry);
        assert_ne!(first, other);
        assert_eq!(ticketing.issue_count(), 2);
    }

    #[tokio::test]
    async fn test_ticketing_outage_is_reported() {
        let ticketing = InMemoryTicketing::new();
        ticketing.set_unavailable(true);
        assert!(matches!(
            ticketing.create_issue(&request("k")).await,
            Err(TicketingError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_engine_checkpoints_follow_signals() {
        let engine = InMemoryEngine::new();
        let id = ExecutionId::new("wf-poc-abc");
        engine
            .start_execution(&id, "poc", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(engine.checkpoint(&id).unwrap().step_number, 0);

        engine
            .signal(
                &id,
                engine_signals::STEP_COMMITTED,
                serde_json::json!({"step_number": 2, "state": {"k": "v"}}),
            )
            .await
            .unwrap();
        let cp = engine.get_checkpoint(&id).await.unwrap().unwrap();
        assert_eq!(cp.step_number, 2);
        assert_eq!(cp.status, CheckpointStatus::Running);
        assert_eq!(cp.state["k"], "v");

        engine
            .signal(&id, engine_signals::EXECUTION_COMPLETED, serde_json::json!({}))
            .await
            .unwrap();
        let cp = engine.checkpoint(&id).unwrap();
        assert_eq!((cp.step_number, cp.status), (2, CheckpointStatus::Completed));
    }

    #[tokio::test]
    async fn test_engine_injected_failures() {
        let engine = InMemoryEngine::new();
        let id = ExecutionId::new("wf-poc-abc");
        engine.start_execution(&id, "poc", serde_json::json!({})).await.unwrap();
        assert!(matches!(
            engine.start_execution(&id, "poc", serde_json::json!({})).await,
            Err(EngineError::AlreadyStarted(_))
        ));

        engine.fail_signal(engine_signals::STEP_COMMITTED);
        assert!(engine
            .signal(&id, engine_signals::STEP_COMMITTED, serde_json::json!({"step_number": 1}))
            .await
            .is_err());
        engine.clear_signal_failures();

        engine.set_unavailable(true);
        assert!(matches!(
            engine.get_checkpoint(&id).await,
            Err(EngineError::Unavailable(_))
        ));
    }
}
