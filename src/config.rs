//! Layered configuration for the orchestration engine.
//!
//! Precedence, lowest to highest: built-in defaults, `ralph.toml` in the
//! current directory, environment variables prefixed `RALPH_`.
//!
//! Unlike the accessor this module's ancestor exposed, there is no process
//! singleton here: `RalphConfig::load` is called once at startup and the
//! result is threaded explicitly into `Engine::new`, so tests can construct
//! engines against independent configurations.

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::{default_data_dir, Settings};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RalphConfig {
    /// Admission cap on concurrently running projects.
    pub max_parallel_projects: u32,
    /// Retries per task before it transitions to `blocked`.
    pub max_task_attempts: u32,
    /// Root directory under which per-project workspaces are checked out.
    pub workspaces_path: PathBuf,
    /// Executable name or path of the code-agent CLI.
    pub agent_executable: String,
    /// Root directory for `state.json` and per-task logs.
    pub data_dir: PathBuf,
    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "ralphd=debug".
    pub log_level: String,
    /// Hard wall-clock timeout for the verifier's test runner.
    pub verifier_timeout_secs: u64,
    /// Output cap for the verifier's test runner, in bytes.
    pub verifier_output_cap_bytes: u64,
    /// Grace period between SIGTERM and SIGKILL for a cancelled agent process.
    pub agent_grace_period_secs: u64,
    /// Backoff between Orchestrator loop iterations.
    pub inter_iteration_sleep_ms: u64,
    /// Whether the verifier's self-review pass defaults to a pass when the
    /// agent's output carries neither `VERIFICATION_PASSED` nor
    /// `VERIFICATION_FAILED` nor any recognized lenient phrase. Defaults to
    /// `true` (generous); set to `false` to require an explicit pass signal.
    pub verifier_lenient_default_pass: bool,
}

impl Default for RalphConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            max_parallel_projects: 3,
            max_task_attempts: 3,
            workspaces_path: data_dir.join("workspaces"),
            agent_executable: "claude".to_string(),
            data_dir,
            log_level: "info".to_string(),
            verifier_timeout_secs: 300,
            verifier_output_cap_bytes: 10 * 1024 * 1024,
            agent_grace_period_secs: 2,
            inter_iteration_sleep_ms: 2000,
            verifier_lenient_default_pass: true,
        }
    }
}

impl RalphConfig {
    /// Load configuration from defaults, then `ralph.toml`, then `RALPH_*` env vars.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let mut builder = Config::builder()
            .set_default("max_parallel_projects", defaults.max_parallel_projects)?
            .set_default("max_task_attempts", defaults.max_task_attempts)?
            .set_default(
                "workspaces_path",
                defaults.workspaces_path.to_string_lossy().to_string(),
            )?
            .set_default("agent_executable", defaults.agent_executable.clone())?
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("log_level", defaults.log_level.clone())?
            .set_default("verifier_timeout_secs", defaults.verifier_timeout_secs)?
            .set_default(
                "verifier_output_cap_bytes",
                defaults.verifier_output_cap_bytes,
            )?
            .set_default("agent_grace_period_secs", defaults.agent_grace_period_secs)?
            .set_default(
                "inter_iteration_sleep_ms",
                defaults.inter_iteration_sleep_ms,
            )?
            .set_default(
                "verifier_lenient_default_pass",
                defaults.verifier_lenient_default_pass,
            )?;

        if Path::new("ralph.toml").exists() {
            builder = builder.add_source(File::with_name("ralph"));
        }

        builder = builder.add_source(
            Environment::with_prefix("RALPH")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load a `.env` file from the current directory, if present.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("loaded environment variables from .env file");
        }
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    pub fn as_settings(&self) -> Settings {
        Settings {
            max_parallel_projects: self.max_parallel_projects,
            max_task_attempts: self.max_task_attempts,
            workspaces_path: self.workspaces_path.clone(),
            agent_executable: self.agent_executable.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recognized_options() {
        let defaults = RalphConfig::default();
        assert_eq!(defaults.max_parallel_projects, 3);
        assert_eq!(defaults.max_task_attempts, 3);
        assert_eq!(defaults.agent_executable, "claude");
    }

    #[test]
    fn as_settings_carries_the_four_spec_fields() {
        let config = RalphConfig::default();
        let settings = config.as_settings();
        assert_eq!(settings.max_parallel_projects, config.max_parallel_projects);
        assert_eq!(settings.agent_executable, config.agent_executable);
    }
}
