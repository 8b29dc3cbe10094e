//! `Engine`: the single owned container composing every component,
//! built once at startup and threaded explicitly into its collaborators —
//! favoring explicit composition over per-service singleton accessors.
//!
//! The methods here are the in-process realization of the IPC surface:
//! a future UI/bridge process would wrap each one verbatim. The `cli/`
//! module is the other realization, calling straight through to these.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::RalphConfig;
use crate::error::EngineError;
use crate::engine::event_bus::EventBus;
use crate::engine::git_driver::GitDriver;
use crate::engine::orchestrator::{Orchestrator, RunState};
use crate::engine::state_manager::{state_file_path, ProjectInput, StateManager};
use crate::engine::verifier::Verifier;
use crate::engine::workspace_store::{project_workspace_dir, WorkspaceStore};
use crate::engine::agent_runner::AgentRunner;
use crate::external::command::{CommandExecutor, ProcessCommandExecutor};
use crate::fs::{FileSystemOperations, StandardFileSystem};
use crate::model::{
    LogsDocument, Project, ProjectStatus, Repository, StateSnapshot, Task, WorkspaceProjectContext,
};

pub struct Engine {
    pub state: Arc<StateManager>,
    pub workspace: Arc<WorkspaceStore>,
    pub git: Arc<GitDriver>,
    pub agent_runner: Arc<AgentRunner>,
    pub verifier: Arc<Verifier>,
    pub orchestrator: Arc<Orchestrator>,
    pub events: EventBus,
    pub config: RalphConfig,
    executor: Arc<dyn CommandExecutor>,
    /// Tasks created before a project's workspace exists are buffered
    /// here and flushed into `tasks.json` the
    /// first time the workspace is materialized.
    pending_tasks: Mutex<HashMap<Uuid, Vec<Task>>>,
}

impl Engine {
    pub async fn new(config: RalphConfig) -> Arc<Self> {
        let events = EventBus::new();
        let state = StateManager::load(state_file_path(&config.data_dir), events.clone()).await;
        state
            .update_settings(|settings| *settings = config.as_settings())
            .await;

        let fs: Arc<dyn FileSystemOperations> = Arc::new(StandardFileSystem);
        let workspace = Arc::new(WorkspaceStore::new(fs));
        let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessCommandExecutor);
        let git = Arc::new(GitDriver::new(Arc::clone(&executor)));

        let agent_runner = Arc::new(
            AgentRunner::new(config.agent_executable.clone(), events.clone())
                .with_grace_period(Duration::from_secs(config.agent_grace_period_secs)),
        );
        let verifier = Arc::new(
            Verifier::new(Arc::clone(&executor), Arc::clone(&agent_runner))
                .with_test_timeout(Duration::from_secs(config.verifier_timeout_secs))
                .with_output_cap_bytes(config.verifier_output_cap_bytes as usize)
                .with_lenient_default_pass(config.verifier_lenient_default_pass),
        );

        let orchestrator = Orchestrator::with_inter_iteration_sleep(
            Arc::clone(&state),
            Arc::clone(&workspace),
            Arc::clone(&git),
            Arc::clone(&agent_runner),
            Arc::clone(&verifier),
            events.clone(),
            config.workspaces_path.clone(),
            config.data_dir.join("logs"),
            Duration::from_millis(config.inter_iteration_sleep_ms),
        );

        Arc::new(Self {
            state,
            workspace,
            git,
            agent_runner,
            verifier,
            orchestrator,
            events,
            config,
            executor,
            pending_tasks: Mutex::new(HashMap::new()),
        })
    }

    // ---- state:* -----------------------------------------------------

    pub async fn state_get(&self) -> StateSnapshot {
        self.state.get_state().await
    }

    pub async fn state_save(&self) -> Result<(), EngineError> {
        self.state.flush_now().await.map_err(Into::into)
    }

    // ---- repository:* --------------------------------------------------

    pub async fn repository_list(&self) -> Vec<Repository> {
        self.state.get_state().await.repositories
    }

    pub async fn repository_create(&self, repository: Repository) -> Repository {
        self.state.create_repository(repository).await
    }

    pub async fn repository_delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.state.delete_repository(id).await.map_err(Into::into)
    }

    // ---- project:* -------------------------------------------------------

    pub async fn project_list(&self) -> Vec<Project> {
        self.state.get_state().await.projects
    }

    pub async fn project_get(&self, id: Uuid) -> Option<Project> {
        self.state.get_state().await.projects.into_iter().find(|p| p.id == id)
    }

    pub async fn project_create(&self, input: ProjectInput) -> Project {
        let project = self.state.create_project(input).await;
        // Best-effort materialization: the workspace is materialized on
        // first start or immediately after creation.
        let _ = self.ensure_workspace(project.id).await;
        project
    }

    pub async fn project_update<F>(&self, id: Uuid, patch: F) -> Result<Project, EngineError>
    where
        F: FnOnce(&mut Project),
    {
        self.state.update_project(id, patch).await.map_err(Into::into)
    }

    pub async fn project_delete(&self, id: Uuid) -> Result<(), EngineError> {
        self.state.delete_project(id).await.map_err(Into::into)
    }

    pub async fn project_clear_loop_logs(&self, project_id: Uuid) -> Result<(), EngineError> {
        let checkout_dir = self.require_checkout_dir(project_id).await?;
        self.workspace.clear_logs(&checkout_dir).await?;
        self.events
            .publish(crate::engine::event_bus::EngineEvent::WorkspaceLogsChanged { project_id });
        Ok(())
    }

    pub async fn project_get_workspace_logs(&self, project_id: Uuid) -> Result<LogsDocument, EngineError> {
        let checkout_dir = self.require_checkout_dir(project_id).await?;
        self.workspace.read_logs(&checkout_dir).await.map_err(Into::into)
    }

    /// Materializes `<workspace>/<repo>/.ralph/` for a project whose
    /// workspace does not exist yet (clone + initialize), flushing any
    /// buffered tasks created before the workspace existed.
    pub async fn ensure_workspace(&self, project_id: Uuid) -> Result<PathBuf, EngineError> {
        let snapshot = self.state.get_state().await;
        let project = snapshot
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or(EngineError::WorkspaceMissing(project_id))?
            .clone();
        let repo = snapshot
            .repositories
            .iter()
            .find(|r| r.id == project.repository_id)
            .ok_or(EngineError::RepositoryNotFound(project.repository_id))?
            .clone();

        let checkout_dir = project_workspace_dir(&self.config.workspaces_path, project_id, &repo.name);
        let clone = self.git.clone_or_reuse(&checkout_dir, &repo.remote_url);
        if !clone.ok {
            return Err(EngineError::Io(std::io::Error::other(
                clone.error.unwrap_or_else(|| "clone failed".to_string()),
            )));
        }

        let context = WorkspaceProjectContext {
            id: project.id,
            name: project.name.clone(),
            description: project.description.clone(),
            product_brief: project.product_brief.clone(),
            solution_brief: project.solution_brief.clone(),
        };
        self.workspace.initialize_ralph_folder(&checkout_dir, &context).await?;

        let mut pending = self.pending_tasks.lock().await;
        if let Some(tasks) = pending.remove(&project_id) {
            if !tasks.is_empty() {
                let mut document = self.workspace.read_tasks(&checkout_dir).await?;
                document.tasks.extend(tasks);
                self.workspace.write_tasks(&checkout_dir, &document).await?;
            }
        }

        Ok(checkout_dir)
    }

    async fn require_checkout_dir(&self, project_id: Uuid) -> Result<PathBuf, EngineError> {
        let snapshot = self.state.get_state().await;
        let project = snapshot
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or(EngineError::WorkspaceMissing(project_id))?;
        let repo = snapshot
            .repositories
            .iter()
            .find(|r| r.id == project.repository_id)
            .ok_or(EngineError::RepositoryNotFound(project.repository_id))?;
        let checkout_dir = project_workspace_dir(&self.config.workspaces_path, project_id, &repo.name);
        if !checkout_dir.join(".ralph").join("tasks.json").exists() {
            return Err(EngineError::WorkspaceMissing(project_id));
        }
        Ok(checkout_dir)
    }

    // ---- task:* -------------------------------------------------------

    pub async fn task_list(&self, project_id: Uuid) -> Result<Vec<Task>, EngineError> {
        match self.require_checkout_dir(project_id).await {
            Ok(checkout_dir) => Ok(self.workspace.read_tasks(&checkout_dir).await?.tasks),
            Err(EngineError::WorkspaceMissing(_)) => {
                Ok(self.pending_tasks.lock().await.get(&project_id).cloned().unwrap_or_default())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn task_get(&self, project_id: Uuid, task_id: Uuid) -> Result<Task, EngineError> {
        self.task_list(project_id)
            .await?
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or(EngineError::TaskNotFound(task_id))
    }

    /// Creates a task. If the project's workspace does not exist yet, the
    /// task is buffered in memory until `ensure_workspace` runs.
    pub async fn task_create(&self, project_id: Uuid, task: Task) -> Result<Task, EngineError> {
        match self.require_checkout_dir(project_id).await {
            Ok(checkout_dir) => {
                let mut document = self.workspace.read_tasks(&checkout_dir).await?;
                document.tasks.push(task.clone());
                self.workspace.write_tasks(&checkout_dir, &document).await?;
                Ok(task)
            }
            Err(EngineError::WorkspaceMissing(_)) => {
                self.pending_tasks
                    .lock()
                    .await
                    .entry(project_id)
                    .or_default()
                    .push(task.clone());
                Ok(task)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn task_update<F>(&self, project_id: Uuid, task_id: Uuid, patch: F) -> Result<Task, EngineError>
    where
        F: FnOnce(&mut Task),
    {
        let checkout_dir = self.require_checkout_dir(project_id).await?;
        let mut document = self.workspace.read_tasks(&checkout_dir).await?;
        let task = document
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(EngineError::TaskNotFound(task_id))?;
        patch(task);
        let updated = task.clone();
        self.workspace.write_tasks(&checkout_dir, &document).await?;
        Ok(updated)
    }

    pub async fn task_delete(&self, project_id: Uuid, task_id: Uuid) -> Result<(), EngineError> {
        let checkout_dir = self.require_checkout_dir(project_id).await?;
        let mut document = self.workspace.read_tasks(&checkout_dir).await?;
        let before = document.tasks.len();
        document.tasks.retain(|t| t.id != task_id);
        if document.tasks.len() == before {
            return Err(EngineError::TaskNotFound(task_id));
        }
        self.workspace.write_tasks(&checkout_dir, &document).await?;
        Ok(())
    }

    /// Reassigns `priority` to match the order of `ordered_task_ids`.
    pub async fn task_reorder(&self, project_id: Uuid, ordered_task_ids: &[Uuid]) -> Result<(), EngineError> {
        let checkout_dir = self.require_checkout_dir(project_id).await?;
        let mut document = self.workspace.read_tasks(&checkout_dir).await?;
        for (priority, task_id) in ordered_task_ids.iter().enumerate() {
            if let Some(task) = document.tasks.iter_mut().find(|t| t.id == *task_id) {
                task.priority = priority as i64;
            }
        }
        self.workspace.write_tasks(&checkout_dir, &document).await?;
        Ok(())
    }

    // ---- logs:* ---------------------------------------------------------

    pub async fn logs_get(&self, project_id: Uuid) -> Result<LogsDocument, EngineError> {
        self.project_get_workspace_logs(project_id).await
    }

    // ---- orchestrator:* ---------------------------------------------------

    pub async fn orchestrator_start(self: &Arc<Self>, project_id: Uuid) -> Result<(), EngineError> {
        self.ensure_workspace(project_id).await?;
        self.orchestrator.start(project_id).await.map_err(Into::into)
    }

    pub async fn orchestrator_stop(&self, project_id: Uuid) -> Result<(), EngineError> {
        self.orchestrator.stop(project_id).await.map_err(Into::into)
    }

    pub async fn orchestrator_pause(&self, project_id: Uuid) -> Result<(), EngineError> {
        self.orchestrator.pause(project_id).await.map_err(Into::into)
    }

    pub async fn orchestrator_resume(self: &Arc<Self>, project_id: Uuid) -> Result<(), EngineError> {
        self.orchestrator.resume(project_id).await.map_err(Into::into)
    }

    pub async fn orchestrator_status(&self) -> HashMap<Uuid, RunState> {
        self.orchestrator.status().await
    }

    // ---- github:* ---------------------------------------------------------

    pub async fn github_auth_status(&self) -> Result<bool, EngineError> {
        match self.executor.execute("gh", &["auth", "status"]).await {
            Ok(output) => Ok(output.success()),
            Err(e) => Err(EngineError::GitHubCli(e.to_string())),
        }
    }

    pub async fn github_login(&self) -> Result<(), EngineError> {
        match self.executor.execute("gh", &["auth", "login", "--web"]).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(EngineError::GitHubCli(output.stderr)),
            Err(e) => Err(EngineError::GitHubCli(e.to_string())),
        }
    }

    /// `gh api /user/repos --paginate -q '...'`, parsed as newline-delimited
    /// JSON and sorted by `nameWithOwner`.
    pub async fn github_list_repos(&self) -> Result<Vec<GitHubRepoListing>, EngineError> {
        let query = ".[] | {name, nameWithOwner:.full_name, url:.html_url, owner:{login:.owner.login}, isPrivate:.private}";
        let output = self
            .executor
            .execute("gh", &["api", "/user/repos", "--paginate", "-q", query])
            .await
            .map_err(|e| EngineError::GitHubCli(e.to_string()))?;
        if !output.success() {
            return Err(EngineError::GitHubCli(output.stderr));
        }

        let mut repos: Vec<GitHubRepoListing> = output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        repos.sort_by(|a, b| a.name_with_owner.cmp(&b.name_with_owner));
        Ok(repos)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GitHubRepoOwner {
    pub login: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct GitHubRepoListing {
    pub name: String,
    #[serde(rename = "nameWithOwner")]
    pub name_with_owner: String,
    pub url: String,
    pub owner: GitHubRepoOwner,
    #[serde(rename = "isPrivate")]
    pub is_private: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_config(dir: &std::path::Path) -> RalphConfig {
        let mut config = RalphConfig::default();
        config.data_dir = dir.join("data");
        config.workspaces_path = dir.join("workspaces");
        config
    }

    #[tokio::test]
    async fn project_create_without_repository_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path()).await).await;

        let repo = engine
            .repository_create(Repository {
                id: Uuid::new_v4(),
                name: "repo".to_string(),
                owner: "acme".to_string(),
                remote_url: "git@github.com:acme/repo.git".to_string(),
                default_base_branch: "main".to_string(),
                is_private: false,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await;

        let project = engine
            .project_create(ProjectInput {
                repository_id: repo.id,
                name: "Demo".to_string(),
                description: "desc".to_string(),
                product_brief: None,
                solution_brief: None,
                base_branch: None,
                max_iterations: None,
            })
            .await;

        assert_eq!(project.status, ProjectStatus::Idle);
    }

    #[tokio::test]
    async fn task_create_before_workspace_exists_is_buffered_then_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path()).await).await;

        let repo = engine
            .repository_create(Repository {
                id: Uuid::new_v4(),
                name: "repo".to_string(),
                owner: "acme".to_string(),
                remote_url: "does-not-exist".to_string(),
                default_base_branch: "main".to_string(),
                is_private: false,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await;
        let project = engine
            .state
            .create_project(ProjectInput {
                repository_id: repo.id,
                name: "Demo".to_string(),
                description: String::new(),
                product_brief: None,
                solution_brief: None,
                base_branch: None,
                max_iterations: None,
            })
            .await;

        let task = Task::new("t1", "d1", 0);
        engine.task_create(project.id, task.clone()).await.unwrap();

        let listed = engine.task_list(project.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "t1");
    }

    #[test]
    fn github_repo_listing_round_trips_through_json() {
        let line = r#"{"name":"repo","nameWithOwner":"acme/repo","url":"https://github.com/acme/repo","owner":{"login":"acme"},"isPrivate":false}"#;
        let listing: GitHubRepoListing = serde_json::from_str(line).unwrap();
        assert_eq!(listing.name_with_owner, "acme/repo");
        assert!(!listing.is_private);
    }
}
