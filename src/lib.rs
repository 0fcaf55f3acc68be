// Beads Bridge Library - coordination between the beads tracker and a durable execution engine
// This exposes the core components for embedding and integration tests

pub mod bridge;
pub mod config;
pub mod error;
pub mod external;
pub mod handlers;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod priority;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod saga;
pub mod shutdown;
pub mod telemetry;

// Re-export key types for easy access
pub use bridge::{BridgeBuilder, BridgeState, CoordinationBridge, StartWorkflowRequest, WorkflowStart};
pub use config::{config, init_config, BridgeConfig};
pub use error::{BridgeError, Result};
pub use external::{
    BeadsCliTicketing, Checkpoint, CheckpointStatus, CreateIssueRequest, EngineError, ExecutionEngine,
    InMemoryEngine, InMemoryTicketing, IssueStatus, TicketingError, TicketingStore,
};
pub use handlers::{HandoffHandler, TicketCommentHandler};
pub use models::{
    AgentAssignment, AgentId, AgentType, AssignRequest, AssignmentId, AssignmentStatus, ExecutionId,
    IssueId, MappingStatus, NewMapping, ResultType, WorkType, WorkflowMapping, WorkflowResult,
};
pub use observability::{bridge_metrics, create_saga_span, BridgeMetrics, OperationTimer};
pub use priority::Priority;
pub use recovery::{Reconciler, RecoveryReport};
pub use registry::{AnalyticsFilter, AssignMode, FailurePolicy, Registry, WorkflowAnalytics};
pub use router::{Router, RouterSettings, Signal, SignalHandler, SignalKind};
pub use saga::{Saga, SagaContext, SagaExecutor, SagaOutcome, SagaReport, SagaStep};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry, shutdown_telemetry};
