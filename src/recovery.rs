//! Crash recovery reconciler
//!
//! Runs once before the bridge serves work. Every checkpoint is fetched
//! before any repair is written, so an engine outage aborts the run without
//! leaving half-repaired state behind. The execution engine's checkpoint is
//! the source of truth; the registry and the ticketing store are brought in
//! line with it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{BridgeError, Result};
use crate::external::{Checkpoint, EngineError, ExecutionEngine, IssueStatus, TicketingStore};
use crate::models::{AgentId, AssignmentStatus, ExecutionId, MappingStatus, WorkflowMapping};
use crate::observability::{bridge_metrics, OperationTimer};
use crate::registry::Registry;
use crate::router::{RecoveryPayload, Router, SignalKind};

/// Reason recorded on mappings that never checkpointed
pub const NO_CHECKPOINT_REASON: &str = "NoCheckpoint";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Registry snapshot token the incomplete set was read at
    pub snapshot: u64,
    pub found: usize,
    pub restored: usize,
    pub failed_no_checkpoint: Vec<ExecutionId>,
    pub reassigned: usize,
    pub repaired_assignments: usize,
    pub tickets_corrected: usize,
    /// Non-fatal problems, mostly ticketing writes
    pub errors: Vec<String>,
}

pub struct Reconciler {
    registry: Arc<Registry>,
    engine: Arc<dyn ExecutionEngine>,
    ticketing: Arc<dyn TicketingStore>,
    router: Arc<Router>,
}

fn aborted(what: impl std::fmt::Display) -> BridgeError {
    BridgeError::RecoveryAborted {
        reason: what.to_string(),
    }
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn ExecutionEngine>,
        ticketing: Arc<dyn TicketingStore>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            registry,
            engine,
            ticketing,
            router,
        }
    }

    pub async fn run(&self) -> Result<RecoveryReport> {
        let timer = OperationTimer::new("recovery");
        match self.reconcile().await {
            Ok(report) => {
                bridge_metrics().record_recovery();
                info!(
                    found = report.found,
                    restored = report.restored,
                    failed_no_checkpoint = report.failed_no_checkpoint.len(),
                    reassigned = report.reassigned,
                    tickets_corrected = report.tickets_corrected,
                    errors = report.errors.len(),
                    duration_ms = timer.finish(),
                    "Recovery completed"
                );
                Ok(report)
            }
            Err(e) => {
                bridge_metrics().record_recovery_aborted();
                error!(error = %e, "Recovery aborted, bridge will not accept work");
                Err(e)
            }
        }
    }

    async fn reconcile(&self) -> Result<RecoveryReport> {
        let incomplete = self.registry.list_incomplete().await.map_err(aborted)?;
        let mut report = RecoveryReport {
            snapshot: incomplete.snapshot,
            found: incomplete.mappings.len(),
            ..Default::default()
        };
        info!(
            snapshot = incomplete.snapshot,
            found = report.found,
            "Starting recovery"
        );

        let mut plan: Vec<(WorkflowMapping, Option<Checkpoint>)> = Vec::new();
        for mapping in incomplete.mappings {
            let checkpoint = match self.engine.get_checkpoint(&mapping.execution_id).await {
                Ok(checkpoint) => checkpoint,
                Err(EngineError::ExecutionNotFound(_)) => None,
                Err(e) => {
                    return Err(aborted(format!(
                        "checkpoint fetch for {} failed: {}",
                        mapping.execution_id, e
                    )))
                }
            };
            plan.push((mapping, checkpoint));
        }

        for (mapping, checkpoint) in plan {
            match checkpoint {
                None => self.fail_unstarted(&mapping, &mut report).await?,
                Some(checkpoint) => self.restore(&mapping, &checkpoint, &mut report).await?,
            }
        }
        Ok(report)
    }

    async fn fail_unstarted(
        &self,
        mapping: &WorkflowMapping,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let id = &mapping.execution_id;
        warn!(execution_id = %id, issue_id = %mapping.issue_id, "No checkpoint, failing mapping");

        let cancelled = self
            .registry
            .cancel_active_assignments(id)
            .await
            .map_err(aborted)?;
        report.repaired_assignments += cancelled.len();
        self.registry
            .set_mapping_status(id, MappingStatus::Failed, Some(NO_CHECKPOINT_REASON.to_string()))
            .await
            .map_err(aborted)?;
        report.failed_no_checkpoint.push(id.clone());

        self.correct_ticket(mapping, MappingStatus::Failed, report).await;
        self.announce(
            id,
            RecoveryPayload {
                outcome: format!("failed ({})", NO_CHECKPOINT_REASON),
                checkpoint_step: None,
                reassigned: false,
            },
            report,
        )
        .await;
        Ok(())
    }

    async fn restore(
        &self,
        mapping: &WorkflowMapping,
        checkpoint: &Checkpoint,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let id = &mapping.execution_id;
        self.engine
            .restore_from_checkpoint(id, checkpoint)
            .await
            .map_err(|e| aborted(format!("restore of {} failed: {}", id, e)))?;
        report.restored += 1;

        let target = checkpoint.status.mapping_status();
        let reassigned = self
            .repair_assignments(mapping, checkpoint, target, report)
            .await?;

        if target != mapping.status {
            self.registry
                .set_mapping_status(
                    id,
                    target,
                    Some(format!("restored from checkpoint at step {}", checkpoint.step_number)),
                )
                .await
                .map_err(aborted)?;
        }

        self.correct_ticket(mapping, target, report).await;
        self.announce(
            id,
            RecoveryPayload {
                outcome: target.to_string(),
                checkpoint_step: Some(checkpoint.step_number),
                reassigned,
            },
            report,
        )
        .await;
        info!(
            execution_id = %id,
            checkpoint_step = checkpoint.step_number,
            status = %target,
            reassigned,
            "Mapping restored"
        );
        Ok(())
    }

    /// Returns true if an interrupted step was re-issued
    async fn repair_assignments(
        &self,
        mapping: &WorkflowMapping,
        checkpoint: &Checkpoint,
        target: MappingStatus,
        report: &mut RecoveryReport,
    ) -> Result<bool> {
        let id = &mapping.execution_id;
        let Some(active) = self.registry.active_assignment(id).await.map_err(aborted)? else {
            return Ok(false);
        };

        if target.is_terminal() {
            let cancelled = self
                .registry
                .cancel_active_assignments(id)
                .await
                .map_err(aborted)?;
            report.repaired_assignments += cancelled.len();
            return Ok(false);
        }

        if active.step_number <= checkpoint.step_number {
            // The step is durably committed; only the completion was lost
            if active.status == AssignmentStatus::Assigned {
                self.registry
                    .transition(active.id, AssignmentStatus::Started)
                    .await
                    .map_err(aborted)?;
            }
            self.registry
                .transition(active.id, AssignmentStatus::Completed)
                .await
                .map_err(aborted)?;
            report.repaired_assignments += 1;
            return Ok(false);
        }

        if active.status == AssignmentStatus::Started {
            let replacement = self
                .registry
                .reissue_assignment(active.id, AgentId::generate(active.agent_type))
                .await
                .map_err(aborted)?;
            info!(
                execution_id = %id,
                step_number = replacement.step_number,
                attempt = replacement.attempt,
                agent_id = %replacement.agent_id,
                "Interrupted step re-assigned"
            );
            report.reassigned += 1;
            return Ok(true);
        }

        Ok(false)
    }

    async fn correct_ticket(
        &self,
        mapping: &WorkflowMapping,
        status: MappingStatus,
        report: &mut RecoveryReport,
    ) {
        let desired = IssueStatus::for_mapping(status);
        let issue = &mapping.issue_id;
        match self.ticketing.issue_status(issue).await {
            Ok(current) if current == desired => {}
            Ok(current) => match self.ticketing.update_issue_status(issue, desired).await {
                Ok(()) => {
                    info!(issue_id = %issue, from = %current, to = %desired, "Ticket status corrected");
                    report.tickets_corrected += 1;
                }
                Err(e) => report
                    .errors
                    .push(format!("ticket update {}: {}", issue, e)),
            },
            Err(e) => report.errors.push(format!("ticket read {}: {}", issue, e)),
        }
    }

    async fn announce(&self, id: &ExecutionId, payload: RecoveryPayload, report: &mut RecoveryReport) {
        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                report.errors.push(format!("recovery signal {}: {}", id, e));
                return;
            }
        };
        if let Err(e) = self
            .router
            .emit(id, SignalKind::RecoveryCompleted, payload)
            .await
        {
            report.errors.push(format!("recovery signal {}: {}", id, e));
        }
    }
}
