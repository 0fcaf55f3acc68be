//! Mapping & assignment registry
//!
//! Owns every `WorkflowMapping` and `AgentAssignment`. Writes to one mapping
//! are linearized through a per-mapping async mutex; distinct mappings never
//! contend. The mutex is also the anchor of the single-active-owner rule:
//! the active-assignment check and the insert happen under the same guard.

pub mod analytics;
pub mod file;
#[cfg(feature = "database")]
pub mod sqlite;
pub mod store;

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::models::{
    AgentAssignment, AgentId, AssignRequest, AssignmentId, AssignmentStatus, ExecutionId,
    IssueId, MappingStatus, NewMapping, WorkType, WorkflowMapping, WorkflowResult,
};
use crate::observability::bridge_metrics;

pub use analytics::{AnalyticsFilter, WorkflowAnalytics};
pub use file::FileRegistryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteRegistryStore;
pub use store::{MemoryRegistryStore, RegistryState, RegistryStore};

/// Which work types end their mapping when an assignment fails or is cancelled
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    terminal: HashSet<WorkType>,
}

impl FailurePolicy {
    pub fn all_terminal() -> Self {
        Self::from_work_types(WorkType::ALL)
    }

    pub fn none_terminal() -> Self {
        Self {
            terminal: HashSet::new(),
        }
    }

    pub fn from_work_types(work_types: impl IntoIterator<Item = WorkType>) -> Self {
        Self {
            terminal: work_types.into_iter().collect(),
        }
    }

    pub fn is_terminal(&self, work_type: WorkType) -> bool {
        self.terminal.contains(&work_type)
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::all_terminal()
    }
}

/// What `assign` does when the mapping already has an active owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignMode {
    /// Return `OwnershipConflict` immediately
    FailFast,
    /// Wait up to the given duration for the owner to finish
    Wait(Duration),
}

/// Point-in-time view of the active mappings
#[derive(Debug, Clone)]
pub struct IncompleteSet {
    /// Store sequence token the read was bounded by
    pub snapshot: u64,
    pub mappings: Vec<WorkflowMapping>,
}

#[derive(Default)]
struct MappingSlot {
    write: tokio::sync::Mutex<()>,
    /// Signalled whenever the mapping's active slot frees up or the mapping ends
    released: Notify,
}

pub struct Registry {
    store: Arc<dyn RegistryStore>,
    slots: Mutex<HashMap<ExecutionId, Arc<MappingSlot>>>,
    creation: tokio::sync::Mutex<()>,
    policy: FailurePolicy,
}

impl Registry {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self::with_policy(store, FailurePolicy::default())
    }

    pub fn with_policy(store: Arc<dyn RegistryStore>, policy: FailurePolicy) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            creation: tokio::sync::Mutex::new(()),
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    fn slot(&self, id: &ExecutionId) -> Arc<MappingSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        slots.entry(id.clone()).or_default().clone()
    }

    /// Drop the slot of an ended mapping once no caller holds it.
    /// Terminal mappings never change again, so a later lookup may start a fresh slot.
    fn release_slot(&self, id: &ExecutionId) {
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        if slots.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(id);
            debug!(execution_id = %id, "Released slot of ended mapping");
        }
    }

    fn release_if_ended<T>(&self, id: &ExecutionId, result: &Result<T>) {
        if let Err(BridgeError::MappingNotActive { status, .. }) = result {
            if status.is_terminal() {
                self.release_slot(id);
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Register a new unit of work
    pub async fn create_mapping(&self, new: NewMapping) -> Result<WorkflowMapping> {
        let _creating = self.creation.lock().await;

        if self.store.find_by_issue(&new.issue_id).await?.is_some() {
            return Err(BridgeError::AlreadyMapped(new.issue_id));
        }
        if self.store.get_mapping(&new.execution_id).await?.is_some() {
            return Err(BridgeError::ExecutionIdInUse(new.execution_id));
        }
        if let Some(parent) = &new.parent {
            self.validate_parent(parent, &new.execution_id).await?;
        }

        let now = Utc::now();
        let mapping = self
            .store
            .insert_mapping(WorkflowMapping {
                issue_id: new.issue_id,
                execution_id: new.execution_id,
                work_type: new.work_type,
                status: MappingStatus::Active,
                status_reason: None,
                priority: new.priority,
                parent: new.parent,
                metadata: new.metadata,
                seq: 0,
                created_at: now,
                updated_at: now,
                completed_at: None,
            })
            .await?;

        bridge_metrics().record_mapping_created();
        info!(
            execution_id = %mapping.execution_id,
            issue_id = %mapping.issue_id,
            work_type = %mapping.work_type,
            priority = %mapping.priority,
            seq = mapping.seq,
            "Workflow mapping created"
        );
        Ok(mapping)
    }

    /// Parents must exist and the chain above them must not lead back to `child`
    async fn validate_parent(&self, parent: &ExecutionId, child: &ExecutionId) -> Result<()> {
        let mut visited = HashSet::new();
        let mut cursor = Some(parent.clone());
        while let Some(current) = cursor {
            if &current == child || !visited.insert(current.clone()) {
                return Err(BridgeError::InvalidParent {
                    parent: parent.clone(),
                    reason: "parent chain would form a cycle".to_string(),
                });
            }
            let mapping = self.store.get_mapping(&current).await?.ok_or_else(|| {
                BridgeError::InvalidParent {
                    parent: parent.clone(),
                    reason: format!("mapping {} does not exist", current),
                }
            })?;
            cursor = mapping.parent;
        }
        Ok(())
    }

    /// Grant the next step of a mapping to an agent
    pub async fn assign(
        &self,
        id: &ExecutionId,
        request: AssignRequest,
        mode: AssignMode,
    ) -> Result<AgentAssignment> {
        let result = self.assign_in_slot(id, request, mode).await;
        self.release_if_ended(id, &result);
        result
    }

    async fn assign_in_slot(
        &self,
        id: &ExecutionId,
        request: AssignRequest,
        mode: AssignMode,
    ) -> Result<AgentAssignment> {
        let slot = self.slot(id);
        let deadline = match mode {
            AssignMode::FailFast => None,
            AssignMode::Wait(limit) => Some((Instant::now() + limit, limit)),
        };

        loop {
            let released = slot.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let _write = slot.write.lock().await;
                match self.assign_locked(id, &request, None).await {
                    Err(BridgeError::OwnershipConflict { holder, .. }) if deadline.is_some() => {
                        debug!(execution_id = %id, holder = %holder, "Waiting for active owner to finish");
                    }
                    other => return other,
                }
            }

            if let Some((deadline, limit)) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero()
                    || tokio::time::timeout(remaining, released).await.is_err()
                {
                    return Err(BridgeError::AssignTimeout {
                        execution_id: id.clone(),
                        waited_ms: limit.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Idempotent assignment keyed by `(mapping, step_number)`.
    ///
    /// If the step was already assigned the existing record is returned
    /// unchanged, so a redelivered handoff signal is a no-op.
    pub async fn assign_step(
        &self,
        id: &ExecutionId,
        step_number: u32,
        request: AssignRequest,
    ) -> Result<AgentAssignment> {
        let result = self.assign_step_in_slot(id, step_number, request).await;
        self.release_if_ended(id, &result);
        result
    }

    async fn assign_step_in_slot(
        &self,
        id: &ExecutionId,
        step_number: u32,
        request: AssignRequest,
    ) -> Result<AgentAssignment> {
        let slot = self.slot(id);
        let _write = slot.write.lock().await;

        let existing = self
            .store
            .list_assignments(id)
            .await?
            .into_iter()
            .filter(|a| a.step_number == step_number)
            .max_by_key(|a| a.id);
        if let Some(existing) = existing {
            debug!(
                execution_id = %id,
                step_number,
                assignment_id = %existing.id,
                "Step already assigned"
            );
            return Ok(existing);
        }

        self.assign_locked(id, &request, Some(step_number)).await
    }

    async fn assign_locked(
        &self,
        id: &ExecutionId,
        request: &AssignRequest,
        required_step: Option<u32>,
    ) -> Result<AgentAssignment> {
        let mut mapping = self
            .store
            .get_mapping(id)
            .await?
            .ok_or_else(|| BridgeError::MappingNotFound(id.clone()))?;
        if mapping.status != MappingStatus::Active {
            return Err(BridgeError::MappingNotActive {
                execution_id: id.clone(),
                status: mapping.status,
            });
        }

        let assignments = self.store.list_assignments(id).await?;
        if let Some(holder) = assignments.iter().find(|a| a.is_active()) {
            bridge_metrics().record_ownership_conflict();
            return Err(BridgeError::OwnershipConflict {
                execution_id: id.clone(),
                holder: holder.id,
            });
        }

        let next_step = assignments.iter().map(|a| a.step_number).max().unwrap_or(0) + 1;
        if let Some(requested) = required_step {
            if requested != next_step {
                return Err(BridgeError::StepOutOfOrder {
                    execution_id: id.clone(),
                    expected: next_step,
                    requested,
                });
            }
        }

        let now = Utc::now();
        let assignment = self
            .store
            .insert_assignment(AgentAssignment {
                id: AssignmentId(0),
                execution_id: id.clone(),
                agent_type: request.agent_type,
                agent_id: request.agent_id.clone(),
                step_number: next_step,
                step_name: request.step_name.clone(),
                status: AssignmentStatus::Assigned,
                attempt: 1,
                handoff_from: request.handoff_from.clone(),
                handoff_to: None,
                assigned_at: now,
                started_at: None,
                completed_at: None,
            })
            .await?;

        mapping.updated_at = now;
        self.store.update_mapping(&mapping).await?;

        bridge_metrics().record_assignment();
        info!(
            execution_id = %id,
            assignment_id = %assignment.id,
            agent_id = %assignment.agent_id,
            agent_type = %assignment.agent_type,
            step_number = assignment.step_number,
            step_name = %assignment.step_name,
            "Agent assigned"
        );
        Ok(assignment)
    }

    /// Move an assignment forward: assigned -> started -> completed | failed | cancelled
    pub async fn transition(
        &self,
        assignment_id: AssignmentId,
        new_status: AssignmentStatus,
    ) -> Result<AgentAssignment> {
        let execution_id = self.assignment(assignment_id).await?.execution_id;
        let (assignment, mapping_ended) = self
            .transition_in_slot(&execution_id, assignment_id, new_status)
            .await?;
        if mapping_ended {
            self.release_slot(&execution_id);
        }
        Ok(assignment)
    }

    async fn transition_in_slot(
        &self,
        execution_id: &ExecutionId,
        assignment_id: AssignmentId,
        new_status: AssignmentStatus,
    ) -> Result<(AgentAssignment, bool)> {
        let slot = self.slot(execution_id);
        let _write = slot.write.lock().await;

        let mut assignment = self.assignment(assignment_id).await?;
        if !assignment.status.can_transition_to(new_status) {
            return Err(BridgeError::InvalidTransition {
                entity: "assignment",
                from: assignment.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let now = Utc::now();
        assignment.status = new_status;
        match new_status {
            AssignmentStatus::Started => assignment.started_at = Some(now),
            _ => assignment.completed_at = Some(now),
        }
        self.store.update_assignment(&assignment).await?;
        info!(
            execution_id = %execution_id,
            assignment_id = %assignment_id,
            step_number = assignment.step_number,
            status = %new_status,
            "Assignment transitioned"
        );

        let mut mapping_ended = false;
        if new_status.is_terminal() {
            if matches!(new_status, AssignmentStatus::Failed | AssignmentStatus::Cancelled) {
                mapping_ended = self.propagate_failure(&assignment).await?;
            }
            slot.released.notify_waiters();
        }
        Ok((assignment, mapping_ended))
    }

    /// True when the assignment's outcome ended the mapping
    async fn propagate_failure(&self, assignment: &AgentAssignment) -> Result<bool> {
        let mapping = self.mapping(&assignment.execution_id).await?;
        if mapping.status.is_terminal() || !self.policy.is_terminal(mapping.work_type) {
            return Ok(false);
        }
        let status = match assignment.status {
            AssignmentStatus::Cancelled => MappingStatus::Cancelled,
            _ => MappingStatus::Failed,
        };
        warn!(
            execution_id = %assignment.execution_id,
            assignment_id = %assignment.id,
            work_type = %mapping.work_type,
            status = %status,
            "Assignment outcome ends the mapping"
        );
        self.set_status_locked(
            &assignment.execution_id,
            status,
            Some(format!(
                "assignment {} (step {}) {}",
                assignment.id, assignment.step_number, assignment.status
            )),
        )
        .await?;
        Ok(true)
    }

    /// Change a mapping's status. Repeating the current status only refreshes the reason.
    pub async fn set_mapping_status(
        &self,
        id: &ExecutionId,
        status: MappingStatus,
        reason: Option<String>,
    ) -> Result<WorkflowMapping> {
        let mapping = {
            let slot = self.slot(id);
            let _write = slot.write.lock().await;
            let mapping = self.set_status_locked(id, status, reason).await?;
            if status.is_terminal() {
                slot.released.notify_waiters();
            }
            mapping
        };
        if mapping.status.is_terminal() {
            self.release_slot(id);
        }
        Ok(mapping)
    }

    async fn set_status_locked(
        &self,
        id: &ExecutionId,
        status: MappingStatus,
        reason: Option<String>,
    ) -> Result<WorkflowMapping> {
        let mut mapping = self.mapping(id).await?;
        let now = Utc::now();

        if mapping.status == status {
            if reason.is_some() && reason != mapping.status_reason {
                mapping.status_reason = reason;
                mapping.updated_at = now;
                self.store.update_mapping(&mapping).await?;
            }
            return Ok(mapping);
        }
        if !mapping.status.can_transition_to(status) {
            return Err(BridgeError::InvalidTransition {
                entity: "mapping",
                from: mapping.status.to_string(),
                to: status.to_string(),
            });
        }

        let previous = mapping.status;
        mapping.status = status;
        mapping.status_reason = reason;
        mapping.updated_at = now;
        if status.is_terminal() {
            mapping.completed_at = Some(now);
        }
        self.store.update_mapping(&mapping).await?;
        info!(
            execution_id = %id,
            from = %previous,
            to = %status,
            reason = ?mapping.status_reason,
            "Mapping status changed"
        );
        Ok(mapping)
    }

    /// Append an agent's result. Scores outside [0, 1] are rejected.
    pub async fn record_result(&self, result: WorkflowResult) -> Result<()> {
        result.validate()?;
        let slot = self.slot(&result.execution_id);
        let _write = slot.write.lock().await;

        let mut mapping = self.mapping(&result.execution_id).await?;
        debug!(
            execution_id = %result.execution_id,
            result_type = %result.result_type,
            confidence = ?result.confidence,
            "Recording result"
        );
        self.store.append_result(result).await?;
        mapping.updated_at = Utc::now();
        self.store.update_mapping(&mapping).await?;
        Ok(())
    }

    /// Active mappings as of a snapshot token taken before the scan
    pub async fn list_incomplete(&self) -> Result<IncompleteSet> {
        let snapshot = self.store.snapshot_token().await?;
        let mappings = self
            .store
            .list_mappings(Some(MappingStatus::Active))
            .await?
            .into_iter()
            .filter(|m| m.seq <= snapshot)
            .collect();
        Ok(IncompleteSet { snapshot, mappings })
    }

    /// Replace an orphaned active assignment with a fresh one for the same step.
    ///
    /// The orphan is cancelled without touching the mapping; the replacement
    /// keeps the step number and bumps `attempt`.
    pub async fn reissue_assignment(
        &self,
        stale_id: AssignmentId,
        agent_id: AgentId,
    ) -> Result<AgentAssignment> {
        let execution_id = self.assignment(stale_id).await?.execution_id;
        let slot = self.slot(&execution_id);
        let _write = slot.write.lock().await;

        let mut stale = self.assignment(stale_id).await?;
        if !stale.is_active() {
            return Err(BridgeError::InvalidTransition {
                entity: "assignment",
                from: stale.status.to_string(),
                to: "reissued".to_string(),
            });
        }
        let mapping = self.mapping(&execution_id).await?;
        if mapping.status != MappingStatus::Active {
            return Err(BridgeError::MappingNotActive {
                execution_id,
                status: mapping.status,
            });
        }

        let now = Utc::now();
        stale.status = AssignmentStatus::Cancelled;
        stale.completed_at = Some(now);
        self.store.update_assignment(&stale).await?;

        let replacement = self
            .store
            .insert_assignment(AgentAssignment {
                id: AssignmentId(0),
                execution_id: execution_id.clone(),
                agent_type: stale.agent_type,
                agent_id,
                step_number: stale.step_number,
                step_name: stale.step_name.clone(),
                status: AssignmentStatus::Assigned,
                attempt: stale.attempt + 1,
                handoff_from: stale.handoff_from.clone(),
                handoff_to: None,
                assigned_at: now,
                started_at: None,
                completed_at: None,
            })
            .await?;

        bridge_metrics().record_assignment();
        info!(
            execution_id = %execution_id,
            stale_assignment = %stale.id,
            assignment_id = %replacement.id,
            step_number = replacement.step_number,
            attempt = replacement.attempt,
            "Assignment re-issued"
        );
        Ok(replacement)
    }

    /// Cancel whatever holds the active slot, without propagating to the mapping
    pub async fn cancel_active_assignments(&self, id: &ExecutionId) -> Result<Vec<AgentAssignment>> {
        let slot = self.slot(id);
        let _write = slot.write.lock().await;

        let mut cancelled = Vec::new();
        for mut assignment in self.store.list_assignments(id).await? {
            if !assignment.is_active() {
                continue;
            }
            assignment.status = AssignmentStatus::Cancelled;
            assignment.completed_at = Some(Utc::now());
            self.store.update_assignment(&assignment).await?;
            cancelled.push(assignment);
        }
        if !cancelled.is_empty() {
            info!(execution_id = %id, count = cancelled.len(), "Active assignments cancelled");
            slot.released.notify_waiters();
        }
        Ok(cancelled)
    }

    /// Record who an assignment handed off to
    pub async fn set_handoff_to(
        &self,
        assignment_id: AssignmentId,
        to: AgentId,
    ) -> Result<AgentAssignment> {
        let execution_id = self.assignment(assignment_id).await?.execution_id;
        let slot = self.slot(&execution_id);
        let _write = slot.write.lock().await;

        let mut assignment = self.assignment(assignment_id).await?;
        if assignment.handoff_to.as_ref() != Some(&to) {
            assignment.handoff_to = Some(to);
            self.store.update_assignment(&assignment).await?;
        }
        Ok(assignment)
    }

    pub async fn mapping(&self, id: &ExecutionId) -> Result<WorkflowMapping> {
        self.store
            .get_mapping(id)
            .await?
            .ok_or_else(|| BridgeError::MappingNotFound(id.clone()))
    }

    pub async fn mapping_for_issue(&self, issue_id: &IssueId) -> Result<WorkflowMapping> {
        self.store
            .find_by_issue(issue_id)
            .await?
            .ok_or_else(|| BridgeError::IssueNotMapped(issue_id.clone()))
    }

    pub async fn list_mappings(&self, status: Option<MappingStatus>) -> Result<Vec<WorkflowMapping>> {
        Ok(self.store.list_mappings(status).await?)
    }

    pub async fn assignment(&self, id: AssignmentId) -> Result<AgentAssignment> {
        self.store
            .get_assignment(id)
            .await?
            .ok_or(BridgeError::AssignmentNotFound(id))
    }

    /// Assignment history of a mapping, oldest first
    pub async fn assignments(&self, id: &ExecutionId) -> Result<Vec<AgentAssignment>> {
        Ok(self.store.list_assignments(id).await?)
    }

    pub async fn active_assignment(&self, id: &ExecutionId) -> Result<Option<AgentAssignment>> {
        Ok(self
            .store
            .list_assignments(id)
            .await?
            .into_iter()
            .find(|a| a.is_active()))
    }

    pub async fn results(&self, id: &ExecutionId) -> Result<Vec<WorkflowResult>> {
        Ok(self.store.list_results(Some(id)).await?)
    }

    pub async fn analytics(&self, filter: &AnalyticsFilter) -> Result<WorkflowAnalytics> {
        let mappings = self.store.list_mappings(None).await?;
        let results = self.store.list_results(None).await?;
        Ok(WorkflowAnalytics::compute(filter, &mappings, &results))
    }
}
