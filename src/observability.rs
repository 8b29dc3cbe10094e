//! Lightweight ambient metrics for the two kinds of external process this
//! engine shells out to: the code-agent CLI (`AgentRunner`) and `git`/`gh`
//! (`GitDriver`). Atomic-counter-behind-a-`LazyLock` shape, tracking
//! agent-invocation and git-operation counts since this engine has no REST
//! API client of its own to instrument.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Process-level counters for agent invocations and git operations.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub agent_invocations: AtomicU64,
    pub agent_failures: AtomicU64,
    pub agent_blocked: AtomicU64,
    pub git_operations: AtomicU64,
    pub git_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_agent_invocation(&self) {
        self.agent_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agent_failure(&self) {
        self.agent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_agent_blocked(&self) {
        self.agent_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_git_operation(&self) {
        self.git_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_git_failure(&self) {
        self.git_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            agent_invocations: self.agent_invocations.load(Ordering::Relaxed),
            agent_failures: self.agent_failures.load(Ordering::Relaxed),
            agent_blocked: self.agent_blocked.load(Ordering::Relaxed),
            git_operations: self.git_operations.load(Ordering::Relaxed),
            git_failures: self.git_failures.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            agent_invocations = stats.agent_invocations,
            agent_failures = stats.agent_failures,
            agent_blocked = stats.agent_blocked,
            git_operations = stats.git_operations,
            git_failures = stats.git_failures,
            "engine metrics"
        );
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub agent_invocations: u64,
    pub agent_failures: u64,
    pub agent_blocked: u64,
    pub git_operations: u64,
    pub git_failures: u64,
}

static ENGINE_METRICS: std::sync::LazyLock<EngineMetrics> = std::sync::LazyLock::new(EngineMetrics::new);

pub fn engine_metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}

/// Correlated span for one orchestration iteration, threaded through
/// `tracing`'s span hierarchy rather than passed as a plain argument.
pub fn create_engine_span(operation: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "engine_operation",
        operation = operation,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Times an operation and logs its duration on drop-equivalent `finish()`.
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

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}
