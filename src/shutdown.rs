use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::bridge::{BridgeState, CoordinationBridge};
use crate::observability::bridge_metrics;
use crate::telemetry::shutdown_telemetry;

/// What a graceful shutdown had to give up on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sagas still running after the grace period, told to unwind
    pub sagas_cancelled: usize,
    /// Router lanes emptied before the deadline
    pub drained: bool,
    /// Unsettled signals left for replay on the next start
    pub signals_pending: usize,
}

/// Graceful shutdown coordinator for the bridge
pub struct ShutdownCoordinator {
    grace: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Stop intake, let sagas finish or unwind, then drain the router
    pub async fn shutdown_bridge(&self, bridge: &CoordinationBridge) -> ShutdownReport {
        info!(grace_ms = self.grace.as_millis() as u64, "Initiating graceful shutdown of the bridge...");
        bridge.set_state(BridgeState::ShuttingDown);
        let mut report = ShutdownReport::default();

        if let Err(e) = wait_for_sagas(bridge, self.grace).await {
            warn!("{}", e);
            report.sagas_cancelled = bridge.cancel_inflight_sagas();
            // cancellation is observed between steps and by select!, so this is quick
            if let Err(e) = wait_for_sagas(bridge, self.grace).await {
                warn!("Sagas did not unwind after cancel: {}", e);
            }
        }

        let router = bridge.router();
        report.drained = router.flush_timeout(self.grace).await;
        report.signals_pending = router.outstanding();
        if !report.drained {
            warn!(
                pending = report.signals_pending,
                "Router did not drain, pending signals will replay on next start"
            );
        }
        router.close().await;

        bridge_metrics().log_stats();
        shutdown_telemetry();
        bridge.set_state(BridgeState::Stopped);

        info!("Graceful shutdown completed");
        report
    }
}

async fn wait_for_sagas(bridge: &CoordinationBridge, grace: Duration) -> Result<()> {
    let mut running = bridge.running_sagas();
    timeout(grace, running.wait_for(|n| *n == 0))
        .await
        .map_err(|_| anyhow::anyhow!("Timeout waiting for sagas to finish"))?
        .map_err(|e| anyhow::anyhow!("Saga counter closed: {}", e))?;
    Ok(())
}
