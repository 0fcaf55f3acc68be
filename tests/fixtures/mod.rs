//! Shared harness for the integration tests: durable-store stand-ins that
//! outlive a bridge instance, so a test can "restart" by building a new one.
#![allow(dead_code)]

use async_trait::async_trait;
use beads_bridge::registry::MemoryRegistryStore;
use beads_bridge::router::MemorySignalLog;
use beads_bridge::{
    CoordinationBridge, InMemoryEngine, InMemoryTicketing, Registry, Router, RouterSettings,
    SagaContext, SagaStep,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stores that survive a bridge "process"
pub struct Durable {
    pub store: Arc<MemoryRegistryStore>,
    pub log: Arc<MemorySignalLog>,
    pub engine: Arc<InMemoryEngine>,
    pub ticketing: Arc<InMemoryTicketing>,
}

impl Durable {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryRegistryStore::new()),
            log: Arc::new(MemorySignalLog::new()),
            engine: Arc::new(InMemoryEngine::new()),
            ticketing: Arc::new(InMemoryTicketing::new()),
        }
    }

    /// A fresh bridge process over the same durable state, not yet started
    pub fn bridge(&self) -> Arc<CoordinationBridge> {
        let router = Arc::new(Router::new(
            self.log.clone(),
            RouterSettings {
                max_delivery_attempts: 3,
                retry_backoff: Duration::from_millis(5),
            },
        ));
        Arc::new(
            CoordinationBridge::builder(
                Arc::new(Registry::new(self.store.clone())),
                self.engine.clone(),
                self.ticketing.clone(),
            )
            .router(router)
            .assign_wait(Duration::from_millis(500))
            .build(),
        )
    }

    pub async fn serving_bridge(&self) -> Arc<CoordinationBridge> {
        let bridge = self.bridge();
        bridge.start().await.expect("bridge start");
        bridge
    }
}

/// What the step should do when run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    /// Succeeds, but compensation fails
    FailCompensation,
    /// Never finishes on its own
    Hang,
}

/// Saga step that appends `"<name>:transact"` / `"<name>:compensate"` to a shared journal
pub struct RecordingStep {
    name: String,
    behavior: Behavior,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingStep {
    pub fn new(name: &str, behavior: Behavior, journal: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            journal: journal.clone(),
        }
    }

    fn record(&self, what: &str) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, what));
    }
}

#[async_trait]
impl SagaStep for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transact(&self, ctx: &mut SagaContext) -> anyhow::Result<()> {
        self.record("transact");
        match self.behavior {
            Behavior::Fail => anyhow::bail!("{} exploded", self.name),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Succeed | Behavior::FailCompensation => {
                ctx.set(&self.name, "done")?;
                Ok(())
            }
        }
    }

    async fn compensate(&self, _ctx: &mut SagaContext) -> anyhow::Result<()> {
        self.record("compensate");
        if self.behavior == Behavior::FailCompensation {
            anyhow::bail!("{} cannot be undone", self.name);
        }
        Ok(())
    }
}

pub fn journal() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Poll until `check` holds or the deadline passes
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
