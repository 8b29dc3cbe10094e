use anyhow::Result;
use clap::Parser;

use ralphd::cli::{commands, Cli};
use ralphd::config::RalphConfig;
use ralphd::engine::api::Engine;
use ralphd::shutdown::ShutdownCoordinator;
use ralphd::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = RalphConfig::load_env_file() {
        eprintln!("warning: failed to load .env file: {e}");
    }

    let config = RalphConfig::load()?;

    if let Err(e) = telemetry::init_telemetry(&config.log_level) {
        eprintln!("warning: failed to initialize telemetry: {e}");
    }

    let cli = Cli::parse();
    let engine = Engine::new(config).await;

    let shutdown_orchestrator = engine.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = ShutdownCoordinator::new(shutdown_orchestrator)
            .wait_for_shutdown()
            .await
        {
            tracing::warn!(error = %e, "error during shutdown");
        }
    });

    let result = commands::run(cli, engine).await;

    telemetry::shutdown_telemetry();
    result
}
