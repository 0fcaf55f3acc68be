//! Signal-based handoff router
//!
//! `emit` returns once a signal is durably in the log. Delivery happens on a
//! per-mapping lane task, so signals of one mapping reach handlers in emission
//! order while different mappings proceed independently. The attempt counter
//! is persisted before handlers run; a crash mid-handler leaves the record
//! unsettled and `replay_unhandled` delivers it again. A lane waits out log
//! failures in place instead of skipping ahead.

pub mod log;
pub mod signal;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::RouterConfig;
use crate::error::Result;
use crate::models::ExecutionId;
use crate::observability::bridge_metrics;

pub use log::{FileSignalLog, MemorySignalLog, SignalLog};
pub use signal::{DeliveryState, HandoffPayload, RecoveryPayload, Signal, SignalKind, StepPayload};
#[cfg(feature = "database")]
pub use sqlite::SqliteSignalLog;

/// Handlers must tolerate redelivery of the same signal
#[async_trait]
pub trait SignalHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, signal: &Signal) -> anyhow::Result<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Handler built from a closure over an owned copy of the signal
pub struct FnHandler {
    name: String,
    f: Box<dyn Fn(Signal) -> HandlerFuture + Send + Sync>,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Signal) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |signal| Box::pin(f(signal))),
        }
    }
}

#[async_trait]
impl SignalHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, signal: &Signal) -> anyhow::Result<()> {
        (self.f)(signal.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub max_delivery_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl From<&RouterConfig> for RouterSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            max_delivery_attempts: config.max_delivery_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

const MAX_STORE_BACKOFF: Duration = Duration::from_secs(5);

type HandlerTable = RwLock<HashMap<SignalKind, Vec<Arc<dyn SignalHandler>>>>;

/// Everything a lane task needs; lanes never hold the lane table itself
#[derive(Clone)]
struct Delivery {
    log: Arc<dyn SignalLog>,
    handlers: Arc<HandlerTable>,
    settings: RouterSettings,
    /// Signals queued on a lane but not yet settled
    outstanding: Arc<watch::Sender<usize>>,
}

pub struct Router {
    delivery: Delivery,
    lanes: Mutex<HashMap<ExecutionId, mpsc::UnboundedSender<u64>>>,
}

impl Router {
    pub fn new(log: Arc<dyn SignalLog>, settings: RouterSettings) -> Self {
        let (outstanding, _) = watch::channel(0usize);
        Self {
            delivery: Delivery {
                log,
                handlers: Arc::new(RwLock::new(HashMap::new())),
                settings,
                outstanding: Arc::new(outstanding),
            },
            lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn log(&self) -> &Arc<dyn SignalLog> {
        &self.delivery.log
    }

    pub fn subscribe(&self, kind: SignalKind, handler: Arc<dyn SignalHandler>) {
        info!(kind = %kind, handler = handler.name(), "Signal handler subscribed");
        let mut handlers = self
            .delivery
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    /// Durably record a signal and queue it for delivery
    pub async fn emit(
        &self,
        execution_id: &ExecutionId,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> Result<Signal> {
        // Holding the lane table across the append keeps lane order equal to log order
        let mut lanes = self.lanes.lock().await;
        let signal = self.delivery.log.append(execution_id, kind, payload).await?;
        self.enqueue(&mut lanes, &signal.execution_id, signal.id);

        bridge_metrics().record_signal_emitted();
        debug!(
            signal_id = signal.id,
            execution_id = %signal.execution_id,
            kind = %signal.kind,
            "Signal emitted"
        );
        Ok(signal)
    }

    /// Queue every signal the log has not settled, e.g. after a restart
    pub async fn replay_unhandled(&self) -> Result<usize> {
        let mut lanes = self.lanes.lock().await;
        let unsettled = self.delivery.log.unsettled().await?;
        for signal in &unsettled {
            self.enqueue(&mut lanes, &signal.execution_id, signal.id);
        }
        if !unsettled.is_empty() {
            info!(count = unsettled.len(), "Replaying unhandled signals");
        }
        Ok(unsettled.len())
    }

    /// Wait until every queued signal is handled or dead-lettered
    pub async fn flush(&self) {
        let mut outstanding = self.delivery.outstanding.subscribe();
        // The sender lives in self, so this cannot fail while we hold &self
        let _ = outstanding.wait_for(|n| *n == 0).await;
    }

    /// `flush` with a deadline; false if signals were still in flight
    pub async fn flush_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.flush()).await.is_ok()
    }

    pub fn outstanding(&self) -> usize {
        *self.delivery.outstanding.borrow()
    }

    /// Stop the lane tasks once their queues drain
    pub async fn close(&self) {
        let mut lanes = self.lanes.lock().await;
        debug!(lanes = lanes.len(), "Closing router lanes");
        lanes.clear();
    }

    pub async fn signals(&self, execution_id: &ExecutionId) -> Result<Vec<Signal>> {
        Ok(self.delivery.log.list(Some(execution_id)).await?)
    }

    pub async fn dead_letters(&self) -> Result<Vec<Signal>> {
        Ok(self
            .delivery
            .log
            .list(None)
            .await?
            .into_iter()
            .filter(|s| matches!(s.state, DeliveryState::DeadLettered { .. }))
            .collect())
    }

    fn enqueue(
        &self,
        lanes: &mut HashMap<ExecutionId, mpsc::UnboundedSender<u64>>,
        execution_id: &ExecutionId,
        signal_id: u64,
    ) {
        self.delivery.outstanding.send_modify(|n| *n += 1);

        let sent = lanes
            .entry(execution_id.clone())
            .or_insert_with(|| self.spawn_lane(execution_id.clone()))
            .send(signal_id);

        if let Err(mpsc::error::SendError(signal_id)) = sent {
            warn!(execution_id = %execution_id, "Delivery lane gone, restarting it");
            let lane = self.spawn_lane(execution_id.clone());
            if lane.send(signal_id).is_err() {
                self.delivery.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            }
            lanes.insert(execution_id.clone(), lane);
        }
    }

    fn spawn_lane(&self, execution_id: ExecutionId) -> mpsc::UnboundedSender<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivery = self.delivery.clone();
        tokio::spawn(run_lane(delivery, execution_id, rx));
        tx
    }
}

async fn run_lane(
    delivery: Delivery,
    execution_id: ExecutionId,
    mut queue: mpsc::UnboundedReceiver<u64>,
) {
    debug!(execution_id = %execution_id, "Delivery lane started");
    while let Some(signal_id) = queue.recv().await {
        delivery.deliver(signal_id).await;
        delivery
            .outstanding
            .send_modify(|n| *n = n.saturating_sub(1));
    }
    debug!(execution_id = %execution_id, "Delivery lane stopped");
}

impl Delivery {
    fn handlers_for(&self, kind: &SignalKind) -> Vec<Arc<dyn SignalHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Pause before the next attempt at a failed log operation
    fn store_backoff(&self, failures: u32) -> Duration {
        (self.settings.retry_backoff * failures).clamp(Duration::from_millis(1), MAX_STORE_BACKOFF)
    }

    /// The lane does not move on while the log is unreachable, so a later
    /// signal of the mapping never overtakes this one.
    async fn load(&self, signal_id: u64) -> Option<Signal> {
        let mut failures = 0;
        loop {
            match self.log.get(signal_id).await {
                Ok(signal) => return signal,
                Err(e) => {
                    failures += 1;
                    error!(signal_id, failures, error = %e, "Could not read signal, retrying");
                    tokio::time::sleep(self.store_backoff(failures)).await;
                }
            }
        }
    }

    async fn persist(&self, signal_id: u64, state: DeliveryState) {
        let mut failures = 0;
        loop {
            match self.log.update_state(signal_id, state.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    failures += 1;
                    error!(signal_id, failures, state = ?state, error = %e, "Could not record delivery state, retrying");
                    tokio::time::sleep(self.store_backoff(failures)).await;
                }
            }
        }
    }

    async fn deliver(&self, signal_id: u64) {
        let Some(signal) = self.load(signal_id).await else {
            warn!(signal_id, "Queued signal missing from log");
            return;
        };
        if signal.state.is_settled() {
            debug!(signal_id, "Signal already settled, skipping");
            return;
        }

        let handlers = self.handlers_for(&signal.kind);
        let mut attempts = signal.state.attempts();

        loop {
            attempts += 1;
            self.persist(signal_id, DeliveryState::Delivering { attempts })
                .await;

            match run_handlers(&handlers, &signal).await {
                Ok(()) => {
                    self.persist(signal_id, DeliveryState::Handled { attempts })
                        .await;
                    bridge_metrics().record_signal_handled();
                    debug!(signal_id, kind = %signal.kind, attempts, "Signal handled");
                    return;
                }
                Err(e) if attempts >= self.settings.max_delivery_attempts => {
                    error!(
                        signal_id,
                        execution_id = %signal.execution_id,
                        kind = %signal.kind,
                        attempts,
                        error = %e,
                        "Signal dead-lettered"
                    );
                    self.persist(
                        signal_id,
                        DeliveryState::DeadLettered {
                            attempts,
                            error: e.to_string(),
                        },
                    )
                    .await;
                    bridge_metrics().record_signal_dead_lettered();
                    return;
                }
                Err(e) => {
                    warn!(signal_id, kind = %signal.kind, attempts, error = %e, "Signal handler failed, retrying");
                    tokio::time::sleep(self.settings.retry_backoff * attempts).await;
                }
            }
        }
    }
}

/// Runs every handler; reports the failures together
async fn run_handlers(handlers: &[Arc<dyn SignalHandler>], signal: &Signal) -> anyhow::Result<()> {
    let mut failures = Vec::new();
    for handler in handlers {
        if let Err(e) = handler.handle(signal).await {
            failures.push(format!("{}: {:#}", handler.name(), e));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(failures.join("; ")))
    }
}
