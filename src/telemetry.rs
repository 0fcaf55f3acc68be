use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless;
/// the second subscriber is rejected and the first stays installed.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let installed = if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(format = %config.log_format, "beads-bridge telemetry initialized");
    }
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span carrying the identifiers of one coordination operation
pub fn create_coordination_span(
    operation: &str,
    execution_id: Option<&str>,
    issue_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "bridge_coordination",
        operation = operation,
        execution.id = execution_id,
        issue.id = issue_id,
        correlation.id = correlation_id,
    )
}

/// Flush point for shutdown; the fmt layer writes synchronously
pub fn shutdown_telemetry() {
    tracing::info!("beads-bridge telemetry shutdown complete");
}
