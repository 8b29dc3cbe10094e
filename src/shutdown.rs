//! Propagates process-level shutdown signals down into every running
//! project.
//!
//! The one thing that actually
//! needs draining on SIGINT/SIGTERM is the Orchestrator's set of running
//! project tasks, each carrying its own `CancellationToken`. Calling
//! `Orchestrator::stop` for every non-stopped entry cancels that token,
//! which unwinds the agent subprocess (via `AgentRunner`'s grace-period
//! kill) and reverts any in-progress task back to backlog before the
//! process exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::engine::orchestrator::{EntryStatus, Orchestrator};

/// Default bound on how long shutdown waits for a single project to stop
/// before giving up and moving on to the next one.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

pub struct ShutdownCoordinator {
    orchestrator: Arc<Orchestrator>,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Blocks until SIGINT or SIGTERM arrives, then drains every running
    /// project before returning.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        install_signal_wait().await?;
        info!("shutdown signal received, draining running projects");
        self.shutdown_all_projects().await
    }

    /// Stops every project entry that is not already `Stopped`, bounding
    /// each stop by `grace_period` so one stuck project cannot hang the
    /// whole process.
    pub async fn shutdown_all_projects(&self) -> Result<()> {
        let running: Vec<_> = self
            .orchestrator
            .status()
            .await
            .into_iter()
            .filter(|(_, run_state)| run_state.status != EntryStatus::Stopped)
            .map(|(id, _)| id)
            .collect();

        if running.is_empty() {
            info!("no running projects to drain");
            return Ok(());
        }

        for project_id in running {
            match timeout(self.grace_period, self.orchestrator.stop(project_id)).await {
                Ok(Ok(())) => info!(%project_id, "project stopped cleanly"),
                Ok(Err(e)) => warn!(%project_id, error = %e, "failed to stop project"),
                Err(_) => warn!(%project_id, "timed out waiting for project to stop"),
            }
        }

        crate::observability::engine_metrics().log_stats();
        info!("graceful shutdown completed");
        Ok(())
    }
}

#[cfg(unix)]
async fn install_signal_wait() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn install_signal_wait() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
