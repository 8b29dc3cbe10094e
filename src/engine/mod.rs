//! The orchestration engine: its components, composed once at
//! startup into a single owned `Engine` rather than reached via global
//! statics.

pub mod agent_runner;
pub mod api;
pub mod event_bus;
pub mod git_driver;
pub mod orchestrator;
pub mod prompt;
pub mod state_manager;
pub mod verifier;
pub mod workspace_store;

pub use agent_runner::{AgentRunner, Outcome, ProcessSpec};
pub use api::Engine;
pub use event_bus::{EngineEvent, EventBus};
pub use git_driver::GitDriver;
pub use orchestrator::{EntryStatus, Orchestrator, OrchestratorError, RunState};
pub use state_manager::{ProjectInput, StateError, StateManager};
pub use verifier::{Verifier, VerifierError};
pub use workspace_store::{WorkspaceError, WorkspaceStore};
