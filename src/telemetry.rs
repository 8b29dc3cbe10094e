//! Structured logging setup and correlation-id helpers.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Initialize JSON-structured tracing output, filterable via `log_level`
/// (an `EnvFilter` directive such as `"info"` or `"ralphd=debug,git2=warn"`).
pub fn init_telemetry(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(filter)
        .init();

    tracing::info!("telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations across a single
/// task attempt (execution prompt, verification prompt, git operations).
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common orchestration attributes.
pub fn create_orchestration_span(
    operation: &str,
    project_id: Option<&str>,
    task_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "orchestration",
        operation = operation,
        project.id = project_id,
        task.id = task_id,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Shutdown telemetry gracefully. Structured logging has no explicit
/// shutdown step, so this only exists to bracket the init call at the
/// call site and give shutdown sequencing a consistent log line.
pub fn shutdown_telemetry() {
    tracing::info!("telemetry shutdown complete");
}
