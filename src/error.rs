//! Top-level error type for the `engine::api` seam.
//!
//! Each component carries its own `thiserror` enum at its own seam
//! (`StateError`, `WorkspaceError`, `OrchestratorError`, `VerifierError`);
//! this type collects them at the one boundary a CLI or future IPC bridge
//! calls across, matching the binary's existing `anyhow::Result` style one
//! level up in `main.rs`.

use thiserror::Error;
use uuid::Uuid;

use crate::engine::{OrchestratorError, StateError, WorkspaceError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error("task {0} not found")]
    TaskNotFound(Uuid),
    #[error("project {0} has no workspace yet")]
    WorkspaceMissing(Uuid),
    #[error("repository {0} not found")]
    RepositoryNotFound(Uuid),
    #[error("failed to invoke gh: {0}")]
    GitHubCli(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
