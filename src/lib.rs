// ralphd - orchestration engine for autonomous coding agents working
// against git repositories.
// This exposes the core components for testing and integration.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod fs;
pub mod model;
pub mod observability;
pub mod shutdown;
pub mod telemetry;

pub use config::RalphConfig;
pub use engine::Engine;
pub use error::EngineError;
pub use fs::{FileSystemOperations, StandardFileSystem};
pub use observability::{create_engine_span, engine_metrics, EngineMetrics, OperationTimer};
pub use shutdown::ShutdownCoordinator;
pub use telemetry::{
    create_orchestration_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};
