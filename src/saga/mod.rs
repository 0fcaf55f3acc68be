//! Saga execution engine
//!
//! A saga is an ordered list of steps, each a transaction paired with a
//! compensation. Steps run strictly in order on one task. When a step fails,
//! the steps that committed are compensated in reverse commit order; a failing
//! compensation is recorded and the unwind continues.

pub mod executor;
pub mod lifecycle;
pub mod report;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::models::{AgentType, ExecutionId};

pub use executor::{NoopObserver, SagaExecutor, SagaObserver};
pub use lifecycle::{SagaLifecycle, SagaPhase};
pub use report::{FailureCause, SagaFailure, SagaOutcome, SagaReport, StepRecord, StepState};

/// Data shared between the steps of one saga run
#[derive(Debug, Clone, Default)]
pub struct SagaContext {
    pub saga_id: String,
    pub execution_id: Option<ExecutionId>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl SagaContext {
    pub fn new(saga_id: impl Into<String>) -> Self {
        Self {
            saga_id: saga_id.into(),
            ..Default::default()
        }
    }

    pub fn for_execution(saga_id: impl Into<String>, execution_id: ExecutionId) -> Self {
        Self {
            saga_id: saga_id.into(),
            execution_id: Some(execution_id),
            data: serde_json::Map::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Serialize) -> anyhow::Result<()> {
        self.data.insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// The data map as a JSON object, used as checkpoint state
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone())
    }
}

#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    /// Agent type that owns this step when the saga runs against a mapping
    fn agent_type(&self) -> Option<AgentType> {
        None
    }

    async fn transact(&self, ctx: &mut SagaContext) -> anyhow::Result<()>;

    async fn compensate(&self, ctx: &mut SagaContext) -> anyhow::Result<()>;
}

pub type StepFuture = Pin<Box<dyn Future<Output = anyhow::Result<SagaContext>> + Send>>;
type StepFn = Box<dyn Fn(SagaContext) -> StepFuture + Send + Sync>;

/// Step built from two closures. Each takes the context by value and hands
/// it back; what it returns becomes the context of the next step.
pub struct FnStep {
    name: String,
    agent_type: Option<AgentType>,
    transact: StepFn,
    compensate: StepFn,
}

impl FnStep {
    pub fn new<T, TF, C, CF>(name: impl Into<String>, transact: T, compensate: C) -> Self
    where
        T: Fn(SagaContext) -> TF + Send + Sync + 'static,
        TF: Future<Output = anyhow::Result<SagaContext>> + Send + 'static,
        C: Fn(SagaContext) -> CF + Send + Sync + 'static,
        CF: Future<Output = anyhow::Result<SagaContext>> + Send + 'static,
    {
        Self {
            name: name.into(),
            agent_type: None,
            transact: Box::new(move |ctx| Box::pin(transact(ctx))),
            compensate: Box::new(move |ctx| Box::pin(compensate(ctx))),
        }
    }

    pub fn owned_by(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }
}

#[async_trait]
impl SagaStep for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn agent_type(&self) -> Option<AgentType> {
        self.agent_type
    }

    async fn transact(&self, ctx: &mut SagaContext) -> anyhow::Result<()> {
        *ctx = (self.transact)(ctx.clone()).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut SagaContext) -> anyhow::Result<()> {
        *ctx = (self.compensate)(ctx.clone()).await?;
        Ok(())
    }
}

/// An ordered, immutable list of steps
pub struct Saga {
    id: String,
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl Saga {
    pub fn builder(name: impl Into<String>) -> SagaBuilder {
        SagaBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

pub struct SagaBuilder {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaBuilder {
    pub fn step(mut self, step: impl SagaStep + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn shared_step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn build(self) -> Saga {
        Saga {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            steps: self.steps,
        }
    }
}

/// Operator side of a saga cancellation
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Saga side of a cancellation, observed between and during steps
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves if the handle is gone
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
