use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Process-wide coordination counters
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    pub mappings_created: AtomicU64,
    pub assignments_granted: AtomicU64,
    pub ownership_conflicts: AtomicU64,
    pub sagas_completed: AtomicU64,
    pub sagas_compensated: AtomicU64,
    pub sagas_partially_compensated: AtomicU64,
    pub signals_emitted: AtomicU64,
    pub signals_handled: AtomicU64,
    pub signals_dead_lettered: AtomicU64,
    pub recoveries_run: AtomicU64,
    pub recoveries_aborted: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_mapping_created(&self) {
        self.mappings_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_assignment(&self) {
        self.assignments_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ownership_conflict(&self) {
        self.ownership_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_completed(&self) {
        self.sagas_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_compensated(&self) {
        self.sagas_compensated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_partially_compensated(&self) {
        self.sagas_partially_compensated.fetch_add(1, Ordering::Relaxed);
        warn!("Saga left partially compensated, operator attention required");
    }

    pub fn record_signal_emitted(&self) {
        self.signals_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_handled(&self) {
        self.signals_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_dead_lettered(&self) {
        self.signals_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_aborted(&self) {
        self.recoveries_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> BridgeStats {
        BridgeStats {
            mappings_created: self.mappings_created.load(Ordering::Relaxed),
            assignments_granted: self.assignments_granted.load(Ordering::Relaxed),
            ownership_conflicts: self.ownership_conflicts.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            sagas_compensated: self.sagas_compensated.load(Ordering::Relaxed),
            sagas_partially_compensated: self.sagas_partially_compensated.load(Ordering::Relaxed),
            signals_emitted: self.signals_emitted.load(Ordering::Relaxed),
            signals_handled: self.signals_handled.load(Ordering::Relaxed),
            signals_dead_lettered: self.signals_dead_lettered.load(Ordering::Relaxed),
            recoveries_run: self.recoveries_run.load(Ordering::Relaxed),
            recoveries_aborted: self.recoveries_aborted.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            mappings_created = stats.mappings_created,
            assignments_granted = stats.assignments_granted,
            ownership_conflicts = stats.ownership_conflicts,
            sagas_completed = stats.sagas_completed,
            sagas_compensated = stats.sagas_compensated,
            sagas_partially_compensated = stats.sagas_partially_compensated,
            signals_emitted = stats.signals_emitted,
            signals_handled = stats.signals_handled,
            signals_dead_lettered = stats.signals_dead_lettered,
            recoveries_run = stats.recoveries_run,
            recoveries_aborted = stats.recoveries_aborted,
            "Coordination bridge metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStats {
    pub mappings_created: u64,
    pub assignments_granted: u64,
    pub ownership_conflicts: u64,
    pub sagas_completed: u64,
    pub sagas_compensated: u64,
    pub sagas_partially_compensated: u64,
    pub signals_emitted: u64,
    pub signals_handled: u64,
    pub signals_dead_lettered: u64,
    pub recoveries_run: u64,
    pub recoveries_aborted: u64,
}

static BRIDGE_METRICS: std::sync::LazyLock<BridgeMetrics> =
    std::sync::LazyLock::new(BridgeMetrics::new);

pub fn bridge_metrics() -> &'static BridgeMetrics {
    &BRIDGE_METRICS
}

/// Span for one saga run, correlated with the request that started it
pub fn create_saga_span(saga: &str, execution_id: Option<&str>, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "saga",
        saga.name = saga,
        execution.id = execution_id,
        correlation.id = correlation_id,
    )
}

/// Logs how long an operation took when finished
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(self) -> u64 {
        let duration_ms = self.elapsed_ms();
        info!(
            operation = %self.operation,
            duration_ms,
            "Operation completed"
        );
        duration_ms
    }
}
