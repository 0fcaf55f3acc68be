//! Coordination bridge facade
//!
//! Owns the registry, router and saga executor, and gates every
//! work-accepting call on the startup state: nothing is served until the
//! signal log has been replayed and the reconciler has run.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use crate::config::{BridgeConfig, StoreBackend};
use crate::error::{BridgeError, Result};
use crate::external::{
    engine_signals, CreateIssueRequest, ExecutionEngine, IssueStatus, TicketingStore,
};
use crate::handlers::{HandoffHandler, TicketCommentHandler};
use crate::models::{
    AgentAssignment, AgentId, AgentType, AssignRequest, AssignmentId, AssignmentStatus,
    ExecutionId, IssueId, MappingStatus, NewMapping, WorkType, WorkflowMapping, WorkflowResult,
};
use crate::observability::{bridge_metrics, create_saga_span};
use crate::priority::Priority;
use crate::recovery::{Reconciler, RecoveryReport};
use crate::registry::{
    AnalyticsFilter, AssignMode, FailurePolicy, FileRegistryStore, MemoryRegistryStore, Registry,
    RegistryStore, WorkflowAnalytics,
};
use crate::router::{
    FileSignalLog, HandoffPayload, MemorySignalLog, Router, RouterSettings, Signal, SignalKind,
    SignalLog, StepPayload,
};
use crate::saga::{
    cancel_pair, CancelHandle, FailureCause, Saga, SagaContext, SagaExecutor, SagaObserver,
    SagaOutcome, SagaReport, SagaStep,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::telemetry::{create_coordination_span, generate_correlation_id};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeState {
    Starting,
    Recovering,
    Serving,
    ShuttingDown,
    Stopped,
    Aborted(String),
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Starting => f.write_str("starting"),
            BridgeState::Recovering => f.write_str("recovering"),
            BridgeState::Serving => f.write_str("serving"),
            BridgeState::ShuttingDown => f.write_str("shutting_down"),
            BridgeState::Stopped => f.write_str("stopped"),
            BridgeState::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    pub title: String,
    pub description: Option<String>,
    pub work_type: WorkType,
    pub priority: Priority,
    pub labels: Vec<String>,
    pub metadata: serde_json::Value,
    pub parent: Option<ExecutionId>,
    /// Agent that takes the first step right away
    pub initial_agent: Option<(AgentId, String)>,
    /// Retrying with the same key returns the workflow started the first time
    pub idempotency_key: Option<String>,
}

impl StartWorkflowRequest {
    pub fn new(title: impl Into<String>, work_type: WorkType) -> Self {
        Self {
            title: title.into(),
            description: None,
            work_type,
            priority: Priority::default(),
            labels: Vec::new(),
            metadata: serde_json::Value::Null,
            parent: None,
            initial_agent: None,
            idempotency_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_parent(mut self, parent: ExecutionId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_initial_agent(mut self, agent: AgentId, step_name: impl Into<String>) -> Self {
        self.initial_agent = Some((agent, step_name.into()));
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowStart {
    pub mapping: WorkflowMapping,
    pub assignment: Option<AgentAssignment>,
}

pub struct BridgeBuilder {
    registry: Arc<Registry>,
    engine: Arc<dyn ExecutionEngine>,
    ticketing: Arc<dyn TicketingStore>,
    router: Option<Arc<Router>>,
    executor: SagaExecutor,
    definition: String,
    run_recovery: bool,
    assign_wait: Duration,
    labels: Vec<String>,
}

impl BridgeBuilder {
    pub fn router(mut self, router: Arc<Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn saga_executor(mut self, executor: SagaExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn definition(mut self, definition: impl Into<String>) -> Self {
        self.definition = definition.into();
        self
    }

    pub fn run_recovery(mut self, enabled: bool) -> Self {
        self.run_recovery = enabled;
        self
    }

    pub fn assign_wait(mut self, wait: Duration) -> Self {
        self.assign_wait = wait;
        self
    }

    /// Labels added to every issue the bridge creates
    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn build(self) -> CoordinationBridge {
        let router = self.router.unwrap_or_else(|| {
            Arc::new(Router::new(
                Arc::new(MemorySignalLog::new()),
                RouterSettings::default(),
            ))
        });

        router.subscribe(
            SignalKind::AgentHandoff,
            Arc::new(HandoffHandler::new(
                self.registry.clone(),
                self.engine.clone(),
                self.ticketing.clone(),
            )),
        );
        let comments = Arc::new(TicketCommentHandler::new(
            self.registry.clone(),
            self.ticketing.clone(),
        ));
        for kind in TicketCommentHandler::kinds() {
            router.subscribe(kind, comments.clone());
        }

        let (running_sagas, _) = watch::channel(0usize);
        CoordinationBridge {
            registry: self.registry,
            router,
            engine: self.engine,
            ticketing: self.ticketing,
            executor: self.executor,
            definition: self.definition,
            run_recovery: self.run_recovery,
            assign_wait: self.assign_wait,
            labels: self.labels,
            state: RwLock::new(BridgeState::Starting),
            inflight: Mutex::new(HashMap::new()),
            running_sagas,
        }
    }
}

pub struct CoordinationBridge {
    registry: Arc<Registry>,
    router: Arc<Router>,
    engine: Arc<dyn ExecutionEngine>,
    ticketing: Arc<dyn TicketingStore>,
    executor: SagaExecutor,
    definition: String,
    run_recovery: bool,
    assign_wait: Duration,
    labels: Vec<String>,
    state: RwLock<BridgeState>,
    inflight: Mutex<HashMap<ExecutionId, CancelHandle>>,
    running_sagas: watch::Sender<usize>,
}

impl CoordinationBridge {
    pub fn builder(
        registry: Arc<Registry>,
        engine: Arc<dyn ExecutionEngine>,
        ticketing: Arc<dyn TicketingStore>,
    ) -> BridgeBuilder {
        BridgeBuilder {
            registry,
            engine,
            ticketing,
            router: None,
            executor: SagaExecutor::new(),
            definition: "beads-workflow".to_string(),
            run_recovery: true,
            assign_wait: Duration::from_secs(30),
            labels: Vec::new(),
        }
    }

    /// Build a bridge with stores chosen by configuration
    pub async fn from_config(
        config: &BridgeConfig,
        engine: Arc<dyn ExecutionEngine>,
        ticketing: Arc<dyn TicketingStore>,
    ) -> Result<Self> {
        let policy = FailurePolicy::from_work_types(
            config.registry.terminal_failure_work_types.iter().copied(),
        );
        let registry = Arc::new(Registry::with_policy(
            open_registry_store(config).await?,
            policy,
        ));
        let router = Arc::new(Router::new(
            open_signal_log(config).await?,
            RouterSettings::from(&config.router),
        ));

        Ok(Self::builder(registry, engine, ticketing)
            .router(router)
            .saga_executor(SagaExecutor::new().with_step_timeout(config.saga.step_timeout()))
            .definition(config.recovery.default_definition.clone())
            .run_recovery(config.recovery.run_on_startup)
            .assign_wait(config.registry.assign_wait_timeout())
            .labels(config.ticketing.labels.clone())
            .build())
    }

    pub fn state(&self) -> BridgeState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn set_state(&self, next: BridgeState) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        info!(from = %*state, to = %next, "Bridge state change");
        *state = next;
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn ensure_serving(&self) -> Result<()> {
        match self.state() {
            BridgeState::Serving => Ok(()),
            other => Err(BridgeError::NotServing {
                state: other.to_string(),
            }),
        }
    }

    /// Replay the signal log, reconcile, then begin serving.
    ///
    /// On `RecoveryAborted` the bridge stays `Aborted`; calling `start` again retries.
    pub async fn start(&self) -> Result<Option<RecoveryReport>> {
        match self.state() {
            BridgeState::Serving => return Ok(None),
            BridgeState::ShuttingDown | BridgeState::Stopped | BridgeState::Recovering => {
                return Err(BridgeError::NotServing {
                    state: self.state().to_string(),
                })
            }
            BridgeState::Starting | BridgeState::Aborted(_) => {}
        }
        self.set_state(BridgeState::Recovering);

        match self.recover().await {
            Ok(report) => {
                self.set_state(BridgeState::Serving);
                Ok(report)
            }
            Err(e) => {
                self.set_state(BridgeState::Aborted(e.to_string()));
                Err(e)
            }
        }
    }

    async fn recover(&self) -> Result<Option<RecoveryReport>> {
        let replayed = self
            .router
            .replay_unhandled()
            .await
            .map_err(|e| BridgeError::RecoveryAborted {
                reason: format!("signal log replay failed: {}", e),
            })?;
        self.router.flush().await;
        debug!(replayed, "Signal log replayed");

        let report = if self.run_recovery {
            let reconciler = Reconciler::new(
                self.registry.clone(),
                self.engine.clone(),
                self.ticketing.clone(),
                self.router.clone(),
            );
            Some(reconciler.run().await?)
        } else {
            info!("Startup recovery disabled");
            None
        };
        self.router.flush().await;
        Ok(report)
    }

    /// Create the issue, the mapping and the execution for a new unit of work
    pub async fn start_workflow(&self, request: StartWorkflowRequest) -> Result<WorkflowStart> {
        self.ensure_serving()?;
        let execution_id = ExecutionId::generate(request.work_type);
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span(
            "start_workflow",
            Some(execution_id.as_str()),
            None,
            Some(correlation_id.as_str()),
        );

        async move {
            let mut labels = self.labels.clone();
            labels.extend(request.labels.iter().cloned());
            let idempotency_key = request
                .idempotency_key
                .clone()
                .unwrap_or_else(|| execution_id.to_string());

            let issue_id = self
                .ticketing
                .create_issue(&CreateIssueRequest {
                    title: request.title.clone(),
                    description: request.description.clone(),
                    work_type: request.work_type,
                    priority: request.priority,
                    labels,
                    metadata: request.metadata.clone(),
                    idempotency_key,
                })
                .await?;

            if request.idempotency_key.is_some() {
                if let Ok(existing) = self.registry.mapping_for_issue(&issue_id).await {
                    info!(issue_id = %issue_id, execution_id = %existing.execution_id, "Workflow already started for key");
                    let assignment = self.registry.active_assignment(&existing.execution_id).await?;
                    return Ok(WorkflowStart {
                        mapping: existing,
                        assignment,
                    });
                }
            }

            let mut new = NewMapping::new(issue_id.clone(), execution_id.clone(), request.work_type)
                .with_priority(request.priority)
                .with_metadata(request.metadata.clone());
            if let Some(parent) = request.parent.clone() {
                new = new.with_parent(parent);
            }
            let mapping = self.registry.create_mapping(new).await?;

            let context = serde_json::json!({
                "issue_id": issue_id,
                "work_type": request.work_type,
                "priority": request.priority,
                "metadata": request.metadata,
            });
            if let Err(e) = self
                .engine
                .start_execution(&execution_id, &self.definition, context)
                .await
            {
                warn!(execution_id = %execution_id, error = %e, "Execution failed to start");
                self.registry
                    .set_mapping_status(
                        &execution_id,
                        MappingStatus::Failed,
                        Some(format!("execution start failed: {}", e)),
                    )
                    .await?;
                self.sync_ticket(&issue_id, MappingStatus::Failed).await;
                return Err(e.into());
            }

            let assignment = match request.initial_agent {
                Some((agent, step_name)) => Some(
                    self.registry
                        .assign(
                            &execution_id,
                            AssignRequest::new(request.work_type, agent, step_name),
                            AssignMode::FailFast,
                        )
                        .await?,
                ),
                None => None,
            };

            self.sync_ticket(&issue_id, MappingStatus::Active).await;
            self.router
                .emit(
                    &execution_id,
                    SignalKind::WorkflowStarted,
                    serde_json::json!({ "issue_id": issue_id, "work_type": request.work_type }),
                )
                .await?;

            info!(
                issue_id = %issue_id,
                execution_id = %execution_id,
                work_type = %request.work_type,
                "Workflow started"
            );
            Ok::<_, BridgeError>(WorkflowStart {
                mapping,
                assignment,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn assign(
        &self,
        execution_id: &ExecutionId,
        request: AssignRequest,
        mode: AssignMode,
    ) -> Result<AgentAssignment> {
        self.ensure_serving()?;
        self.registry.assign(execution_id, request, mode).await
    }

    /// The assigned agent picked the step up
    pub async fn begin_step(&self, assignment_id: AssignmentId) -> Result<AgentAssignment> {
        self.ensure_serving()?;
        self.registry
            .transition(assignment_id, AssignmentStatus::Started)
            .await
    }

    /// Checkpoint the step through the engine, then release the mapping
    pub async fn complete_step(
        &self,
        assignment_id: AssignmentId,
        state: serde_json::Value,
    ) -> Result<AgentAssignment> {
        self.ensure_serving()?;
        let assignment = self.registry.assignment(assignment_id).await?;
        self.commit_step(&assignment, state).await
    }

    async fn commit_step(
        &self,
        assignment: &AgentAssignment,
        state: serde_json::Value,
    ) -> Result<AgentAssignment> {
        if !assignment.is_active() {
            return Err(BridgeError::InvalidTransition {
                entity: "assignment",
                from: assignment.status.to_string(),
                to: AssignmentStatus::Completed.to_string(),
            });
        }
        self.engine
            .signal(
                &assignment.execution_id,
                engine_signals::STEP_COMMITTED,
                serde_json::json!({
                    "step_number": assignment.step_number,
                    "step_name": assignment.step_name,
                    "state": state,
                }),
            )
            .await?;

        if assignment.status == AssignmentStatus::Assigned {
            self.registry
                .transition(assignment.id, AssignmentStatus::Started)
                .await?;
        }
        let completed = self
            .registry
            .transition(assignment.id, AssignmentStatus::Completed)
            .await?;

        self.emit_step(
            &completed.execution_id,
            SignalKind::StepCompleted,
            &completed,
            None,
        )
        .await;
        Ok(completed)
    }

    pub async fn fail_step(&self, assignment_id: AssignmentId, error: &str) -> Result<AgentAssignment> {
        self.ensure_serving()?;
        let failed = self
            .registry
            .transition(assignment_id, AssignmentStatus::Failed)
            .await?;
        self.emit_step(
            &failed.execution_id,
            SignalKind::StepFailed,
            &failed,
            Some(error.to_string()),
        )
        .await;

        let mapping = self.registry.mapping(&failed.execution_id).await?;
        if mapping.status == MappingStatus::Failed {
            self.signal_engine(&mapping.execution_id, engine_signals::EXECUTION_FAILED, serde_json::json!({ "error": error }))
                .await;
            self.sync_ticket(&mapping.issue_id, MappingStatus::Failed).await;
        }
        Ok(failed)
    }

    pub async fn record_result(&self, result: WorkflowResult) -> Result<()> {
        self.ensure_serving()?;
        let mapping = self.registry.mapping(&result.execution_id).await?;
        let comment = format!(
            "Results stored: {} (confidence: {:.2})",
            result.result_type,
            result.confidence.unwrap_or(0.0)
        );
        self.registry.record_result(result).await?;
        if let Err(e) = self.ticketing.add_comment(&mapping.issue_id, &comment).await {
            warn!(issue_id = %mapping.issue_id, error = %e, "Could not comment stored results");
        }
        Ok(())
    }

    /// Finish the outgoing step and queue the handoff to the next agent
    pub async fn handoff(
        &self,
        execution_id: &ExecutionId,
        from_assignment: AssignmentId,
        to_agent: AgentId,
        to_agent_type: AgentType,
        step_name: impl Into<String>,
    ) -> Result<Signal> {
        self.ensure_serving()?;
        let from = self.registry.assignment(from_assignment).await?;
        if &from.execution_id != execution_id {
            return Err(BridgeError::AssignmentNotFound(from_assignment));
        }
        let completed = self.commit_step(&from, serde_json::json!({})).await?;

        let payload = HandoffPayload {
            from_assignment,
            from_agent: completed.agent_id.clone(),
            to_agent,
            to_agent_type,
            step_number: completed.step_number + 1,
            step_name: step_name.into(),
        };
        let payload = serde_json::to_value(&payload).map_err(crate::persistence::StoreError::from)?;
        self.router
            .emit(execution_id, SignalKind::AgentHandoff, payload)
            .await
    }

    /// Run a saga against a mapping, one assignment per step.
    ///
    /// The returned report carries the saga outcome; `Err` is reserved for
    /// failures of the bridge itself.
    pub async fn run_saga(&self, execution_id: &ExecutionId, saga: &Saga) -> Result<SagaReport> {
        self.ensure_serving()?;
        let mapping = self.registry.mapping(execution_id).await?;
        if mapping.status != MappingStatus::Active {
            return Err(BridgeError::MappingNotActive {
                execution_id: execution_id.clone(),
                status: mapping.status,
            });
        }

        let (handle, token) = cancel_pair();
        let _slot = SagaSlot::enter(self, execution_id, handle)?;

        let observer = BridgeSagaObserver {
            bridge: self,
            execution_id: execution_id.clone(),
            default_type: mapping.work_type,
            current: tokio::sync::Mutex::new(None),
        };
        let mut ctx = SagaContext::for_execution(saga.id(), execution_id.clone());
        let span = create_saga_span(
            saga.name(),
            Some(execution_id.as_str()),
            &generate_correlation_id(),
        );

        let report = self
            .executor
            .execute(saga, &mut ctx, &observer, token)
            .instrument(span)
            .await;
        self.finish_saga(execution_id, &report).await?;
        Ok(report)
    }

    async fn finish_saga(&self, execution_id: &ExecutionId, report: &SagaReport) -> Result<()> {
        let mapping = self.registry.mapping(execution_id).await?;
        match report.outcome {
            SagaOutcome::Completed => {
                bridge_metrics().record_saga_completed();
                if mapping.status.is_terminal() {
                    warn!(execution_id = %execution_id, status = %mapping.status, "Saga completed after mapping ended");
                    return Ok(());
                }
                self.registry
                    .set_mapping_status(execution_id, MappingStatus::Completed, None)
                    .await?;
                self.signal_engine(execution_id, engine_signals::EXECUTION_COMPLETED, serde_json::json!({}))
                    .await;
                self.sync_ticket(&mapping.issue_id, MappingStatus::Completed).await;
            }
            SagaOutcome::Compensated | SagaOutcome::PartiallyCompensated => {
                if report.outcome == SagaOutcome::Compensated {
                    bridge_metrics().record_saga_compensated();
                } else {
                    bridge_metrics().record_saga_partially_compensated();
                }
                if mapping.status.is_terminal() && mapping.status != MappingStatus::Failed {
                    debug!(execution_id = %execution_id, status = %mapping.status, "Mapping already ended, keeping its status");
                    return Ok(());
                }
                let reason = match (&report.outcome, &report.failure) {
                    (SagaOutcome::PartiallyCompensated, _) => format!(
                        "PartiallyCompensated: {}",
                        report.failed_compensations().join(", ")
                    ),
                    (_, Some(failure)) => format!(
                        "step {} ({}) failed: {}",
                        failure.position, failure.step_name, failure.cause
                    ),
                    (_, None) => "saga failed".to_string(),
                };
                self.registry
                    .set_mapping_status(execution_id, MappingStatus::Failed, Some(reason.clone()))
                    .await?;
                self.signal_engine(
                    execution_id,
                    engine_signals::EXECUTION_FAILED,
                    serde_json::json!({ "reason": reason }),
                )
                .await;
                self.sync_ticket(&mapping.issue_id, MappingStatus::Failed).await;
            }
        }
        Ok(())
    }

    /// Operator cancel: ends the mapping and unwinds any saga in flight
    pub async fn cancel(&self, execution_id: &ExecutionId, reason: &str) -> Result<WorkflowMapping> {
        self.ensure_serving()?;
        let mapping = self
            .registry
            .set_mapping_status(execution_id, MappingStatus::Cancelled, Some(reason.to_string()))
            .await?;
        self.registry.cancel_active_assignments(execution_id).await?;

        if let Some(handle) = self
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(execution_id)
        {
            info!(execution_id = %execution_id, "Cancelling in-flight saga");
            handle.cancel();
        }

        self.signal_engine(
            execution_id,
            engine_signals::EXECUTION_CANCELLED,
            serde_json::json!({ "reason": reason }),
        )
        .await;
        self.sync_ticket(&mapping.issue_id, MappingStatus::Cancelled).await;
        self.router
            .emit(
                execution_id,
                SignalKind::WorkflowCancelled,
                serde_json::json!({ "reason": reason }),
            )
            .await?;
        Ok(mapping)
    }

    pub async fn pause(&self, execution_id: &ExecutionId, reason: &str) -> Result<WorkflowMapping> {
        self.ensure_serving()?;
        let mapping = self
            .registry
            .set_mapping_status(execution_id, MappingStatus::Paused, Some(reason.to_string()))
            .await?;
        self.sync_ticket(&mapping.issue_id, MappingStatus::Paused).await;
        Ok(mapping)
    }

    pub async fn resume(&self, execution_id: &ExecutionId) -> Result<WorkflowMapping> {
        self.ensure_serving()?;
        let mapping = self
            .registry
            .set_mapping_status(execution_id, MappingStatus::Active, None)
            .await?;
        self.sync_ticket(&mapping.issue_id, MappingStatus::Active).await;
        Ok(mapping)
    }

    /// Close a mapping whose work was driven outside a saga
    pub async fn complete_workflow(&self, execution_id: &ExecutionId) -> Result<WorkflowMapping> {
        self.ensure_serving()?;
        if let Some(active) = self.registry.active_assignment(execution_id).await? {
            return Err(BridgeError::OwnershipConflict {
                execution_id: execution_id.clone(),
                holder: active.id,
            });
        }
        let mapping = self
            .registry
            .set_mapping_status(execution_id, MappingStatus::Completed, None)
            .await?;
        self.signal_engine(execution_id, engine_signals::EXECUTION_COMPLETED, serde_json::json!({}))
            .await;
        self.sync_ticket(&mapping.issue_id, MappingStatus::Completed).await;
        Ok(mapping)
    }

    /// Follow-up work on a finished mapping, linked to it as parent
    pub async fn reopen(&self, execution_id: &ExecutionId, title: &str) -> Result<WorkflowStart> {
        self.ensure_serving()?;
        let previous = self.registry.mapping(execution_id).await?;
        if !previous.status.is_terminal() {
            return Err(BridgeError::InvalidTransition {
                entity: "mapping",
                from: previous.status.to_string(),
                to: "reopened".to_string(),
            });
        }
        self.start_workflow(
            StartWorkflowRequest::new(title, previous.work_type)
                .with_priority(previous.priority)
                .with_parent(previous.execution_id.clone())
                .with_metadata(serde_json::json!({ "reopened_from": previous.issue_id })),
        )
        .await
    }

    pub async fn analytics(&self, filter: &AnalyticsFilter) -> Result<WorkflowAnalytics> {
        self.registry.analytics(filter).await
    }

    /// Stop accepting work, drain sagas and signals
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        ShutdownCoordinator::new(grace).shutdown_bridge(self).await
    }

    pub(crate) fn running_sagas(&self) -> watch::Receiver<usize> {
        self.running_sagas.subscribe()
    }

    /// Returns how many sagas were told to cancel
    pub(crate) fn cancel_inflight_sagas(&self) -> usize {
        let inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        for handle in inflight.values() {
            handle.cancel();
        }
        inflight.len()
    }

    async fn sync_ticket(&self, issue_id: &IssueId, status: MappingStatus) {
        let target = IssueStatus::for_mapping(status);
        if let Err(e) = self.ticketing.update_issue_status(issue_id, target).await {
            warn!(issue_id = %issue_id, status = %target, error = %e, "Ticket status sync failed, recovery will repair it");
        }
    }

    async fn signal_engine(&self, execution_id: &ExecutionId, signal_type: &str, payload: serde_json::Value) {
        if let Err(e) = self.engine.signal(execution_id, signal_type, payload).await {
            warn!(execution_id = %execution_id, signal_type, error = %e, "Execution engine signal failed");
        }
    }

    async fn emit_step(
        &self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        assignment: &AgentAssignment,
        error: Option<String>,
    ) {
        let payload = StepPayload {
            step_number: assignment.step_number,
            step_name: assignment.step_name.clone(),
            agent_id: Some(assignment.agent_id.clone()),
            error,
        };
        let result = match serde_json::to_value(&payload) {
            Ok(payload) => self.router.emit(execution_id, kind, payload).await.map(|_| ()),
            Err(e) => Err(crate::persistence::StoreError::from(e).into()),
        };
        if let Err(e) = result {
            warn!(execution_id = %execution_id, error = %e, "Could not emit step signal");
        }
    }
}

/// Registers a running saga for cancel and shutdown; unregisters on drop.
/// At most one saga runs per mapping.
struct SagaSlot<'a> {
    bridge: &'a CoordinationBridge,
    execution_id: ExecutionId,
}

impl<'a> SagaSlot<'a> {
    fn enter(
        bridge: &'a CoordinationBridge,
        execution_id: &ExecutionId,
        handle: CancelHandle,
    ) -> Result<Self> {
        {
            let mut inflight = bridge.inflight.lock().unwrap_or_else(|p| p.into_inner());
            if inflight.contains_key(execution_id) {
                warn!(execution_id = %execution_id, "Refusing second saga on mapping");
                return Err(BridgeError::SagaInFlight(execution_id.clone()));
            }
            inflight.insert(execution_id.clone(), handle);
        }
        bridge.running_sagas.send_modify(|n| *n += 1);
        Ok(Self {
            bridge,
            execution_id: execution_id.clone(),
        })
    }
}

impl Drop for SagaSlot<'_> {
    fn drop(&mut self) {
        self.bridge
            .inflight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.execution_id);
        self.bridge
            .running_sagas
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Binds saga steps to registry assignments and engine checkpoints
struct BridgeSagaObserver<'a> {
    bridge: &'a CoordinationBridge,
    execution_id: ExecutionId,
    default_type: AgentType,
    current: tokio::sync::Mutex<Option<AgentAssignment>>,
}

#[async_trait]
impl SagaObserver for BridgeSagaObserver<'_> {
    async fn before_step(
        &self,
        position: usize,
        step: &dyn SagaStep,
        _ctx: &SagaContext,
    ) -> Result<(), BridgeError> {
        let registry = &self.bridge.registry;
        let mut current = self.current.lock().await;
        *current = None;

        let agent_type = step.agent_type().unwrap_or(self.default_type);
        let adopted = if position == 1 {
            registry.active_assignment(&self.execution_id).await?
        } else {
            None
        };
        let assignment = match adopted {
            Some(existing) => {
                debug!(assignment_id = %existing.id, "Saga adopts active assignment");
                existing
            }
            None => {
                registry
                    .assign(
                        &self.execution_id,
                        AssignRequest::new(agent_type, AgentId::generate(agent_type), step.name()),
                        AssignMode::Wait(self.bridge.assign_wait),
                    )
                    .await?
            }
        };
        let assignment = if assignment.status == AssignmentStatus::Assigned {
            registry
                .transition(assignment.id, AssignmentStatus::Started)
                .await?
        } else {
            assignment
        };
        *current = Some(assignment);
        Ok(())
    }

    async fn step_committed(
        &self,
        _position: usize,
        step: &dyn SagaStep,
        ctx: &SagaContext,
    ) -> Result<(), BridgeError> {
        let assignment = self
            .current
            .lock()
            .await
            .clone()
            .ok_or_else(|| BridgeError::InvalidTransition {
                entity: "saga step",
                from: "unassigned".to_string(),
                to: format!("committed ({})", step.name()),
            })?;
        self.bridge.commit_step(&assignment, ctx.snapshot()).await?;
        *self.current.lock().await = None;
        Ok(())
    }

    async fn step_failed(&self, _position: usize, _step: &dyn SagaStep, cause: &FailureCause) {
        let Some(assignment) = self.current.lock().await.take() else {
            return;
        };
        let registry = &self.bridge.registry;
        let fresh = match registry.assignment(assignment.id).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(assignment_id = %assignment.id, error = %e, "Could not load failed step's assignment");
                return;
            }
        };
        if !fresh.is_active() {
            return;
        }
        let status = match cause {
            FailureCause::OperatorCancelled => AssignmentStatus::Cancelled,
            _ => AssignmentStatus::Failed,
        };
        if let Err(e) = registry.transition(fresh.id, status).await {
            warn!(assignment_id = %fresh.id, error = %e, "Could not close failed step's assignment");
        }
        self.bridge
            .emit_step(
                &self.execution_id,
                SignalKind::StepFailed,
                &fresh,
                Some(cause.to_string()),
            )
            .await;
    }
}

async fn open_registry_store(config: &BridgeConfig) -> Result<Arc<dyn RegistryStore>> {
    match config.registry.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryRegistryStore::new())),
        StoreBackend::File => Ok(Arc::new(
            FileRegistryStore::open(&config.registry.state_file_path).await?,
        )),
        StoreBackend::Sqlite => sqlite_registry_store(config).await,
    }
}

async fn open_signal_log(config: &BridgeConfig) -> Result<Arc<dyn SignalLog>> {
    match config.router.backend {
        StoreBackend::Memory => Ok(Arc::new(MemorySignalLog::new())),
        StoreBackend::File => Ok(Arc::new(
            FileSignalLog::open(&config.router.signal_log_path).await?,
        )),
        StoreBackend::Sqlite => sqlite_signal_log(config).await,
    }
}

#[cfg(feature = "database")]
async fn connect_sqlite(config: &BridgeConfig) -> Result<Arc<crate::registry::SqliteRegistryStore>> {
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| BridgeError::Config("sqlite backend needs a [database] section".to_string()))?;
    Ok(Arc::new(
        crate::registry::SqliteRegistryStore::connect(database).await?,
    ))
}

#[cfg(feature = "database")]
async fn sqlite_registry_store(config: &BridgeConfig) -> Result<Arc<dyn RegistryStore>> {
    let store = connect_sqlite(config).await?;
    Ok(store)
}

#[cfg(feature = "database")]
async fn sqlite_signal_log(config: &BridgeConfig) -> Result<Arc<dyn SignalLog>> {
    let store = connect_sqlite(config).await?;
    Ok(Arc::new(crate::router::SqliteSignalLog::new(store.pool().clone())))
}

#[cfg(not(feature = "database"))]
async fn sqlite_registry_store(_config: &BridgeConfig) -> Result<Arc<dyn RegistryStore>> {
    Err(sqlite_disabled())
}

#[cfg(not(feature = "database"))]
async fn sqlite_signal_log(_config: &BridgeConfig) -> Result<Arc<dyn SignalLog>> {
    Err(sqlite_disabled())
}

#[cfg(not(feature = "database"))]
fn sqlite_disabled() -> BridgeError {
    BridgeError::Config("sqlite backend requires the `database` feature".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{InMemoryEngine, InMemoryTicketing};
    use crate::saga::FnStep;

    async fn serving_bridge() -> (CoordinationBridge, Arc<InMemoryEngine>, Arc<InMemoryTicketing>) {
        let engine = Arc::new(InMemoryEngine::new());
        let ticketing = Arc::new(InMemoryTicketing::new());
        let registry = Arc::new(Registry::new(Arc::new(MemoryRegistryStore::new())));
        let bridge = CoordinationBridge::builder(registry, engine.clone(), ticketing.clone())
            .assign_wait(Duration::from_millis(200))
            .build();
        bridge.start().await.unwrap();
        (bridge, engine, ticketing)
    }

    #[tokio::test]
    async fn test_work_is_refused_before_start() {
        let bridge = CoordinationBridge::builder(
            Arc::new(Registry::new(Arc::new(MemoryRegistryStore::new()))),
            Arc::new(InMemoryEngine::new()),
            Arc::new(InMemoryTicketing::new()),
        )
        .build();

        let result = bridge
            .start_workflow(StartWorkflowRequest::new("early", WorkType::Research))
            .await;
        assert!(matches!(result, Err(BridgeError::NotServing { .. })));
    }

    #[tokio::test]
    async fn test_start_workflow_links_all_three_stores() {
        let (bridge, engine, ticketing) = serving_bridge().await;

        let started = bridge
            .start_workflow(
                StartWorkflowRequest::new("Research tokio", WorkType::Research)
                    .with_priority(Priority::High)
                    .with_initial_agent(AgentId::new("research-01"), "investigate"),
            )
            .await
            .unwrap();

        let mapping = started.mapping;
        assert_eq!(mapping.status, MappingStatus::Active);
        assert_eq!(engine.definition(&mapping.execution_id).as_deref(), Some("beads-workflow"));
        let issue = ticketing.issue(&mapping.issue_id).unwrap();
        assert_eq!(issue.status, IssueStatus::InProgress);
        assert_eq!(started.assignment.unwrap().step_number, 1);
    }

    #[tokio::test]
    async fn test_idempotent_start_returns_existing_workflow() {
        let (bridge, _engine, ticketing) = serving_bridge().await;
        let request = StartWorkflowRequest::new("Docs", WorkType::Documentation)
            .with_idempotency_key("docs-42");

        let first = bridge.start_workflow(request.clone()).await.unwrap();
        let second = bridge.start_workflow(request).await.unwrap();

        assert_eq!(first.mapping.execution_id, second.mapping.execution_id);
        assert_eq!(ticketing.issue_count(), 1);
    }

    #[tokio::test]
    async fn test_engine_start_failure_fails_mapping() {
        let (bridge, engine, _ticketing) = serving_bridge().await;
        engine.set_unavailable(true);

        let result = bridge
            .start_workflow(StartWorkflowRequest::new("Validate", WorkType::Validation))
            .await;
        assert!(matches!(result, Err(BridgeError::Engine(_))));

        let failed = bridge
            .registry()
            .list_mappings(Some(MappingStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_record_result_comments_on_issue() {
        let (bridge, _engine, ticketing) = serving_bridge().await;
        let started = bridge
            .start_workflow(StartWorkflowRequest::new("Research", WorkType::Research))
            .await
            .unwrap();

        bridge
            .record_result(
                WorkflowResult::new(
                    started.mapping.execution_id.clone(),
                    WorkType::Research,
                    crate::models::ResultType::Findings,
                    serde_json::json!({"libraries": ["tokio"]}),
                )
                .with_confidence(0.87),
            )
            .await
            .unwrap();

        let comments = ticketing.comments(&started.mapping.issue_id);
        assert!(comments.contains(&"Results stored: findings (confidence: 0.87)".to_string()));
    }

    #[tokio::test]
    async fn test_run_saga_completes_mapping() {
        let (bridge, engine, _ticketing) = serving_bridge().await;
        let started = bridge
            .start_workflow(StartWorkflowRequest::new("POC", WorkType::Poc))
            .await
            .unwrap();
        let wf = started.mapping.execution_id;

        let saga = Saga::builder("poc")
            .step(FnStep::new(
                "create-impl",
                |mut ctx: SagaContext| async move {
                    ctx.set("branch", "poc/tokio")?;
                    Ok::<_, anyhow::Error>(ctx)
                },
                |ctx: SagaContext| async move { Ok(ctx) },
            ))
            .step(FnStep::new(
                "run-tests",
                |mut ctx: SagaContext| async move {
                    let branch = ctx
                        .get("branch")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("no branch from create-impl"))?
                        .to_string();
                    ctx.set("tested", branch)?;
                    Ok::<_, anyhow::Error>(ctx)
                },
                |ctx: SagaContext| async move { Ok(ctx) },
            ))
            .build();

        let report = bridge.run_saga(&wf, &saga).await.unwrap();

        assert!(report.is_success());
        assert_eq!(bridge.registry().mapping(&wf).await.unwrap().status, MappingStatus::Completed);
        let assignments = bridge.registry().assignments(&wf).await.unwrap();
        assert_eq!(
            assignments.iter().map(|a| a.step_number).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(assignments.iter().all(|a| a.status == AssignmentStatus::Completed));
        let checkpoint = engine.checkpoint(&wf).unwrap();
        assert_eq!(checkpoint.step_number, 2);
        assert_eq!(checkpoint.state["branch"], "poc/tokio");
        assert_eq!(checkpoint.state["tested"], "poc/tokio");
    }
}
