//! Built-in router subscribers
//!
//! Both handlers are safe to run more than once for the same signal: the
//! handoff keys its assignment on `(mapping, step_number)`, and comments are
//! informational.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::external::{engine_signals, ExecutionEngine, TicketingStore};
use crate::models::AssignRequest;
use crate::registry::Registry;
use crate::router::{HandoffPayload, RecoveryPayload, Signal, SignalHandler, SignalKind, StepPayload};

/// Turns an `agent_handoff` signal into the receiving agent's assignment
pub struct HandoffHandler {
    registry: Arc<Registry>,
    engine: Arc<dyn ExecutionEngine>,
    ticketing: Arc<dyn TicketingStore>,
}

impl HandoffHandler {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn ExecutionEngine>,
        ticketing: Arc<dyn TicketingStore>,
    ) -> Self {
        Self {
            registry,
            engine,
            ticketing,
        }
    }
}

#[async_trait]
impl SignalHandler for HandoffHandler {
    fn name(&self) -> &str {
        "handoff"
    }

    async fn handle(&self, signal: &Signal) -> anyhow::Result<()> {
        let handoff: HandoffPayload = signal.decode()?;
        let execution_id = &signal.execution_id;

        let request = AssignRequest::new(
            handoff.to_agent_type,
            handoff.to_agent.clone(),
            handoff.step_name.clone(),
        )
        .handoff_from(handoff.from_agent.clone());

        let assignment = match self
            .registry
            .assign_step(execution_id, handoff.step_number, request)
            .await
        {
            Ok(assignment) => assignment,
            Err(BridgeError::MappingNotActive { status, .. }) => {
                info!(execution_id = %execution_id, %status, "Mapping ended before handoff, dropping it");
                return Ok(());
            }
            Err(e) => return Err(e).context("assigning handoff target"),
        };

        self.registry
            .set_handoff_to(handoff.from_assignment, handoff.to_agent.clone())
            .await
            .context("recording handoff on previous assignment")?;

        self.engine
            .signal(
                execution_id,
                engine_signals::AGENT_HANDOFF,
                serde_json::json!({
                    "from_agent": handoff.from_agent,
                    "to_agent": handoff.to_agent,
                    "step_number": handoff.step_number,
                    "assignment_id": assignment.id,
                }),
            )
            .await
            .context("forwarding handoff to execution engine")?;

        let mapping = self.registry.mapping(execution_id).await?;
        self.ticketing
            .add_comment(
                &mapping.issue_id,
                &format!("Handoff from {} to {}", handoff.from_agent, handoff.to_agent),
            )
            .await
            .context("commenting handoff")?;

        info!(
            execution_id = %execution_id,
            from = %handoff.from_agent,
            to = %handoff.to_agent,
            assignment_id = %assignment.id,
            "Handoff delivered"
        );
        Ok(())
    }
}

/// Mirrors step and lifecycle signals into the issue's comment stream
pub struct TicketCommentHandler {
    registry: Arc<Registry>,
    ticketing: Arc<dyn TicketingStore>,
}

impl TicketCommentHandler {
    pub fn new(registry: Arc<Registry>, ticketing: Arc<dyn TicketingStore>) -> Self {
        Self {
            registry,
            ticketing,
        }
    }

    /// Signal kinds this handler should be subscribed to
    pub fn kinds() -> [SignalKind; 4] {
        [
            SignalKind::StepCompleted,
            SignalKind::StepFailed,
            SignalKind::RecoveryCompleted,
            SignalKind::WorkflowCancelled,
        ]
    }

    fn render(signal: &Signal) -> anyhow::Result<Option<String>> {
        let text = match &signal.kind {
            SignalKind::StepCompleted => {
                let step: StepPayload = signal.decode()?;
                match step.agent_id {
                    Some(agent) => format!(
                        "Step {} ({}) completed by {}",
                        step.step_number, step.step_name, agent
                    ),
                    None => format!("Step {} ({}) completed", step.step_number, step.step_name),
                }
            }
            SignalKind::StepFailed => {
                let step: StepPayload = signal.decode()?;
                format!(
                    "Step {} ({}) failed: {}",
                    step.step_number,
                    step.step_name,
                    step.error.as_deref().unwrap_or("unknown error")
                )
            }
            SignalKind::RecoveryCompleted => {
                let recovery: RecoveryPayload = signal.decode()?;
                let mut text = format!("Recovered after restart: {}", recovery.outcome);
                if let Some(step) = recovery.checkpoint_step {
                    text.push_str(&format!(" (checkpoint at step {})", step));
                }
                if recovery.reassigned {
                    text.push_str(", interrupted step re-assigned");
                }
                text
            }
            SignalKind::WorkflowCancelled => format!(
                "Workflow cancelled: {}",
                signal.payload["reason"].as_str().unwrap_or("no reason given")
            ),
            _ => return Ok(None),
        };
        Ok(Some(text))
    }
}

#[async_trait]
impl SignalHandler for TicketCommentHandler {
    fn name(&self) -> &str {
        "ticket-comments"
    }

    async fn handle(&self, signal: &Signal) -> anyhow::Result<()> {
        let Some(text) = Self::render(signal)? else {
            debug!(kind = %signal.kind, "No comment for signal kind");
            return Ok(());
        };
        let mapping = self.registry.mapping(&signal.execution_id).await?;
        self.ticketing
            .add_comment(&mapping.issue_id, &text)
            .await
            .with_context(|| format!("commenting on {}", mapping.issue_id))?;
        Ok(())
    }
}
