//! Drives each project from idle to terminal.
//!
//! Per-project supervised loop, admission-counter-under-mutex, and
//! explicit tagged task-state value, in the vein of a single-assignment
//! coordinator over `Arc<Mutex<...>>`-guarded state. The atomic multi-step
//! transition pattern (no partial state persisted on failure) mirrors an
//! execute-atomic-transition state machine, minus any issue-label side
//! effects — task state here lives only in `tasks.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::agent_runner::{AgentRunner, ProcessSpec};
use crate::engine::event_bus::EventBus;
use crate::engine::git_driver::GitDriver;
use crate::engine::state_manager::StateManager;
use crate::engine::verifier::Verifier;
use crate::engine::workspace_store::{project_workspace_dir, WorkspaceStore};
use crate::model::{LoopLogEntry, Project, ProjectStatus, Task, TaskStatus, WorkspaceProjectContext};

/// Backoff between loop iterations, avoiding a tight spin when tasks fail quickly.
const DEFAULT_INTER_ITERATION_SLEEP: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("project {0} is already running")]
    AlreadyRunning(Uuid),
    #[error("capacity exceeded: {0} projects already running")]
    CapacityExceeded(u32),
    #[error("project {0} not found")]
    NotFound(Uuid),
    #[error("project {0} is not paused")]
    NotPaused(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Initializing,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub status: EntryStatus,
    pub current_task_id: Option<Uuid>,
    pub current_process_id: Option<u32>,
}

struct Entry {
    status: Mutex<EntryStatus>,
    current_task_id: Mutex<Option<Uuid>>,
    current_process_id: Mutex<Option<u32>>,
    cancel: CancellationToken,
}

impl Entry {
    fn new() -> Self {
        Self {
            status: Mutex::new(EntryStatus::Initializing),
            current_task_id: Mutex::new(None),
            current_process_id: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn snapshot(&self) -> RunState {
        RunState {
            status: *self.status.lock().await,
            current_task_id: *self.current_task_id.lock().await,
            current_process_id: *self.current_process_id.lock().await,
        }
    }
}

pub struct Orchestrator {
    state: Arc<StateManager>,
    workspace: Arc<WorkspaceStore>,
    git: Arc<GitDriver>,
    agent_runner: Arc<AgentRunner>,
    verifier: Arc<Verifier>,
    events: EventBus,
    workspaces_path: PathBuf,
    logs_dir: PathBuf,
    inter_iteration_sleep: Duration,
    entries: Mutex<HashMap<Uuid, Arc<Entry>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<StateManager>,
        workspace: Arc<WorkspaceStore>,
        git: Arc<GitDriver>,
        agent_runner: Arc<AgentRunner>,
        verifier: Arc<Verifier>,
        events: EventBus,
        workspaces_path: PathBuf,
        logs_dir: PathBuf,
    ) -> Arc<Self> {
        Self::with_inter_iteration_sleep(
            state,
            workspace,
            git,
            agent_runner,
            verifier,
            events,
            workspaces_path,
            logs_dir,
            DEFAULT_INTER_ITERATION_SLEEP,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_inter_iteration_sleep(
        state: Arc<StateManager>,
        workspace: Arc<WorkspaceStore>,
        git: Arc<GitDriver>,
        agent_runner: Arc<AgentRunner>,
        verifier: Arc<Verifier>,
        events: EventBus,
        workspaces_path: PathBuf,
        logs_dir: PathBuf,
        inter_iteration_sleep: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            state,
            workspace,
            git,
            agent_runner,
            verifier,
            events,
            workspaces_path,
            logs_dir,
            inter_iteration_sleep,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub async fn status(&self) -> HashMap<Uuid, RunState> {
        let entries = self.entries.lock().await;
        let mut result = HashMap::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            result.insert(*id, entry.snapshot().await);
        }
        result
    }

    /// Admits the project and spawns its supervised loop as a background task.
    pub async fn start(self: &Arc<Self>, project_id: Uuid) -> Result<(), OrchestratorError> {
        let max_parallel_projects = {
            let snapshot = self.state.get_state().await;
            snapshot.settings.unwrap_or_default().max_parallel_projects
        };

        let entry = {
            let mut entries = self.entries.lock().await;
            if entries.contains_key(&project_id) {
                return Err(OrchestratorError::AlreadyRunning(project_id));
            }
            if entries.len() as u32 >= max_parallel_projects {
                return Err(OrchestratorError::CapacityExceeded(max_parallel_projects));
            }
            let entry = Arc::new(Entry::new());
            entries.insert(project_id, Arc::clone(&entry));
            entry
        };

        self.state
            .update_project(project_id, |p| p.status = ProjectStatus::Running)
            .await
            .map_err(|_| OrchestratorError::NotFound(project_id))?;

        *entry.status.lock().await = EntryStatus::Running;

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_project(project_id, entry).await;
        });

        Ok(())
    }

    /// Cancels the running process (if any), reverts an in-flight task to
    /// `backlog`, sets the Project to `idle`, and removes the entry.
    pub async fn stop(&self, project_id: Uuid) -> Result<(), OrchestratorError> {
        let entry = {
            let entries = self.entries.lock().await;
            entries.get(&project_id).cloned()
        };
        let Some(entry) = entry else {
            return Err(OrchestratorError::NotFound(project_id));
        };

        entry.cancel.cancel();
        *entry.status.lock().await = EntryStatus::Stopped;

        if let Some(task_id) = *entry.current_task_id.lock().await {
            self.revert_in_progress_task(project_id, task_id).await;
        }

        let _ = self
            .state
            .update_project(project_id, |p| p.status = ProjectStatus::Idle)
            .await;

        self.entries.lock().await.remove(&project_id);
        self.events.orchestrator_log(project_id, "stopped by request");
        Ok(())
    }

    /// Flips the entry to `paused`; the loop observes this at the next
    /// iteration boundary and exits. In-flight subprocesses are not cancelled.
    pub async fn pause(&self, project_id: Uuid) -> Result<(), OrchestratorError> {
        let entry = {
            let entries = self.entries.lock().await;
            entries.get(&project_id).cloned()
        };
        let Some(entry) = entry else {
            return Err(OrchestratorError::NotFound(project_id));
        };
        *entry.status.lock().await = EntryStatus::Paused;
        let _ = self
            .state
            .update_project(project_id, |p| p.status = ProjectStatus::Paused)
            .await;
        self.events.orchestrator_log(project_id, "paused by request");
        Ok(())
    }

    /// Requires the Project to be `paused`; dispatches `start`.
    pub async fn resume(self: &Arc<Self>, project_id: Uuid) -> Result<(), OrchestratorError> {
        let snapshot = self.state.get_state().await;
        let project = snapshot
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or(OrchestratorError::NotFound(project_id))?;
        if project.status != ProjectStatus::Paused {
            return Err(OrchestratorError::NotPaused(project_id));
        }
        self.entries.lock().await.remove(&project_id);
        self.start(project_id).await
    }

    async fn revert_in_progress_task(&self, project_id: Uuid, task_id: Uuid) {
        let Some((checkout_dir, _)) = self.checkout_dir_for(project_id).await else {
            return;
        };
        if let Ok(mut document) = self.workspace.read_tasks(&checkout_dir).await {
            if let Some(task) = document.tasks.iter_mut().find(|t| t.id == task_id) {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Backlog;
                    task.started_at = None;
                    task.verifying_at = None;
                    task.completed_at = None;
                }
            }
            let _ = self.workspace.write_tasks(&checkout_dir, &document).await;
        }
    }

    async fn checkout_dir_for(&self, project_id: Uuid) -> Option<(PathBuf, Project)> {
        let snapshot = self.state.get_state().await;
        let project = snapshot.projects.iter().find(|p| p.id == project_id)?.clone();
        let repo = snapshot
            .repositories
            .iter()
            .find(|r| r.id == project.repository_id)?;
        Some((
            project_workspace_dir(&self.workspaces_path, project_id, &repo.name),
            project,
        ))
    }

    async fn run_project(self: Arc<Self>, project_id: Uuid, entry: Arc<Entry>) {
        if let Err(e) = self.setup(project_id, &entry).await {
            self.events
                .orchestrator_log(project_id, format!("setup failed: {e}"));
            let _ = self
                .state
                .update_project(project_id, |p| p.status = ProjectStatus::Failed)
                .await;
            self.entries.lock().await.remove(&project_id);
            return;
        }

        loop {
            if *entry.status.lock().await != EntryStatus::Running {
                break;
            }
            if entry.cancel.is_cancelled() {
                break;
            }

            let snapshot = self.state.get_state().await;
            let Some(project) = snapshot.projects.iter().find(|p| p.id == project_id) else {
                break;
            };
            if matches!(project.status, ProjectStatus::Paused | ProjectStatus::Idle) {
                break;
            }

            let Some((checkout_dir, project)) = self.checkout_dir_for(project_id).await else {
                break;
            };

            let tasks = match self.workspace.read_tasks(&checkout_dir).await {
                Ok(document) => document.tasks,
                Err(_) => break,
            };

            let Some(next_task_id) = select_next_task(&tasks) else {
                self.complete_project(project_id, &checkout_dir, &project).await;
                self.entries.lock().await.remove(&project_id);
                return;
            };

            self.execute_task(project_id, &checkout_dir, &project, next_task_id, &entry)
                .await;

            if entry.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inter_iteration_sleep) => {}
                _ = entry.cancel.cancelled() => break,
            }
        }
    }

    async fn setup(&self, project_id: Uuid, entry: &Arc<Entry>) -> anyhow::Result<()> {
        let snapshot = self.state.get_state().await;
        let project = snapshot
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .ok_or_else(|| anyhow::anyhow!("project not found"))?
            .clone();
        let repo = snapshot
            .repositories
            .iter()
            .find(|r| r.id == project.repository_id)
            .ok_or_else(|| anyhow::anyhow!("repository not found"))?
            .clone();

        let checkout_dir = project_workspace_dir(&self.workspaces_path, project_id, &repo.name);
        let base_branch = project.base_branch.clone().unwrap_or(repo.default_base_branch.clone());

        let clone = self.git.clone_or_reuse(&checkout_dir, &repo.remote_url);
        if !clone.ok {
            anyhow::bail!(clone.error.unwrap_or_else(|| "clone failed".to_string()));
        }

        let context = WorkspaceProjectContext {
            id: project.id,
            name: project.name.clone(),
            description: project.description.clone(),
            product_brief: project.product_brief.clone(),
            solution_brief: project.solution_brief.clone(),
        };
        self.workspace.initialize_ralph_folder(&checkout_dir, &context).await?;

        let checkout = self.git.checkout_or_create_branch(&checkout_dir, &base_branch);
        if !checkout.ok {
            anyhow::bail!(checkout.error.unwrap_or_else(|| "checkout failed".to_string()));
        }

        let working = self
            .git
            .create_working_branch(&checkout_dir, &project.working_branch, &base_branch);
        if !working.ok {
            anyhow::bail!(working.error.unwrap_or_else(|| "working branch creation failed".to_string()));
        }

        let _ = entry;
        Ok(())
    }

    async fn execute_task(
        &self,
        project_id: Uuid,
        checkout_dir: &Path,
        project: &Project,
        task_id: Uuid,
        entry: &Arc<Entry>,
    ) {
        let max_task_attempts = self
            .state
            .get_state()
            .await
            .settings
            .unwrap_or_default()
            .max_task_attempts;

        let Ok(mut document) = self.workspace.read_tasks(checkout_dir).await else {
            return;
        };
        let Some(task_index) = document.tasks.iter().position(|t| t.id == task_id) else {
            return;
        };

        {
            let task = &mut document.tasks[task_index];
            task.status = TaskStatus::InProgress;
            task.attempts += 1;
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            task.verifying_at = None;
            task.completed_at = None;
        }
        if self.workspace.write_tasks(checkout_dir, &document).await.is_err() {
            return;
        }

        *entry.current_task_id.lock().await = Some(task_id);

        let task = document.tasks[task_index].clone();
        let other_tasks: Vec<Task> = document
            .tasks
            .iter()
            .filter(|t| t.id != task_id)
            .cloned()
            .collect();

        let prompt = crate::engine::prompt::execution_prompt(
            project.product_brief.as_deref(),
            project.solution_brief.as_deref(),
            &task,
            &other_tasks,
        );

        let log_file_path = self.task_log_path(project_id, task_id, "exec");
        let spec = ProcessSpec {
            project_id,
            task_id,
            prompt,
            working_directory: checkout_dir.clone(),
            log_file_path,
            allowed_tools: vec![
                "Read".to_string(),
                "Edit".to_string(),
                "Grep".to_string(),
                "Glob".to_string(),
                "Bash(git add:*)".to_string(),
                "Bash(git commit:*)".to_string(),
                "Bash(git status:*)".to_string(),
                "Bash(npm test:*)".to_string(),
                "Bash(cargo test:*)".to_string(),
                "Bash(pytest:*)".to_string(),
                "Bash(go test:*)".to_string(),
            ],
            disallowed_tools: vec!["Bash(git push:*)".to_string(), "Bash(gh:*)".to_string()],
        };

        let outcome = match self.agent_runner.run(spec, entry.cancel.clone()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.append_loop_log(
                    project_id,
                    checkout_dir,
                    Some(task_id),
                    "execute",
                    None,
                    None,
                    format!("agent runner error: {e}"),
                )
                .await;
                return;
            }
        };
        *entry.current_process_id.lock().await = outcome.pid;

        if outcome.stopped || entry.cancel.is_cancelled() {
            return;
        }

        if outcome.task_blocked {
            self.append_task_log(
                checkout_dir,
                task_id,
                format!(
                    "blocked: {}",
                    outcome.blocked_reason.as_deref().unwrap_or("no reason given")
                ),
                false,
            )
            .await;

            let mut document = match self.workspace.read_tasks(checkout_dir).await {
                Ok(d) => d,
                Err(_) => return,
            };
            if let Some(task) = document.tasks.iter_mut().find(|t| t.id == task_id) {
                if task.attempts >= max_task_attempts {
                    task.status = TaskStatus::Blocked;
                    task.completed_at = Some(Utc::now());
                }
            }
            let _ = self.workspace.write_tasks(checkout_dir, &document).await;
            return;
        }

        if outcome.task_complete {
            let mut document = match self.workspace.read_tasks(checkout_dir).await {
                Ok(d) => d,
                Err(_) => return,
            };
            if let Some(task) = document.tasks.iter_mut().find(|t| t.id == task_id) {
                task.status = TaskStatus::Verifying;
                task.verifying_at = Some(Utc::now());
            }
            if self.workspace.write_tasks(checkout_dir, &document).await.is_err() {
                return;
            }

            let diff = self.git.get_diff(checkout_dir);
            let verify_log_path = self.task_log_path(project_id, task_id, "verify");
            let verification = self
                .verifier
                .verify_task(
                    project_id,
                    task_id,
                    checkout_dir,
                    &task.title,
                    &task.description,
                    &task.acceptance_criteria,
                    &diff.output,
                    verify_log_path,
                    entry.cancel.clone(),
                )
                .await;

            let mut document = match self.workspace.read_tasks(checkout_dir).await {
                Ok(d) => d,
                Err(_) => return,
            };
            let Some(task_ref) = document.tasks.iter_mut().find(|t| t.id == task_id) else {
                return;
            };

            if verification.passed {
                task_ref.status = TaskStatus::Done;
                task_ref.completed_at = Some(Utc::now());
                let title = task_ref.title.clone();
                self.append_task_log(checkout_dir, task_id, "verification passed".to_string(), true)
                    .await;
                if self.workspace.write_tasks(checkout_dir, &document).await.is_err() {
                    return;
                }
                let commit = self.git.commit(checkout_dir, &format!("Complete task: {title}"));
                if !commit.ok {
                    self.events.orchestrator_log(
                        project_id,
                        format!("commit failed: {}", commit.error.unwrap_or_default()),
                    );
                }
            } else if task_ref.attempts >= max_task_attempts {
                task_ref.status = TaskStatus::Blocked;
                task_ref.completed_at = Some(Utc::now());
                self.append_task_log(
                    checkout_dir,
                    task_id,
                    format!(
                        "verification failed: {}",
                        verification.review.reason.as_deref().unwrap_or("unknown")
                    ),
                    false,
                )
                .await;
                let _ = self.workspace.write_tasks(checkout_dir, &document).await;
            } else {
                task_ref.status = TaskStatus::InProgress;
                self.append_task_log(
                    checkout_dir,
                    task_id,
                    format!(
                        "verification failed, retrying: {}",
                        verification.review.reason.as_deref().unwrap_or("unknown")
                    ),
                    false,
                )
                .await;
                let _ = self.workspace.write_tasks(checkout_dir, &document).await;
            }
            return;
        }

        // Neither complete nor blocked: leave in_progress, retry next iteration.
        self.append_loop_log(
            project_id,
            checkout_dir,
            Some(task_id),
            "execute",
            None,
            None,
            "agent produced neither TASK_COMPLETE nor TASK_BLOCKED".to_string(),
        )
        .await;
    }

    async fn complete_project(&self, project_id: Uuid, checkout_dir: &Path, project: &Project) {
        let tasks = self
            .workspace
            .read_tasks(checkout_dir)
            .await
            .map(|d| d.tasks)
            .unwrap_or_default();

        let completed: Vec<&Task> = tasks.iter().filter(|t| t.status == TaskStatus::Done).collect();
        let blocked: Vec<&Task> = tasks.iter().filter(|t| t.status == TaskStatus::Blocked).collect();

        if completed.is_empty() {
            let final_status = if blocked.is_empty() {
                ProjectStatus::Completed
            } else {
                ProjectStatus::Failed
            };
            let _ = self
                .state
                .update_project(project_id, move |p| p.status = final_status)
                .await;
            let _ = self.git.cleanup_workspace(checkout_dir);
            return;
        }

        let base_branch = match project.base_branch.clone() {
            Some(base_branch) => base_branch,
            None => {
                let snapshot = self.state.get_state().await;
                snapshot
                    .repositories
                    .iter()
                    .find(|r| r.id == project.repository_id)
                    .map(|r| r.default_base_branch.clone())
                    .unwrap_or_else(|| "main".to_string())
            }
        };
        let diff = self.git.get_diff_from_base(checkout_dir, &base_branch);
        if diff.ok && diff.output.trim().is_empty() {
            let _ = self
                .state
                .update_project(project_id, |p| p.status = ProjectStatus::Completed)
                .await;
            let _ = self.git.cleanup_workspace(checkout_dir);
            return;
        }

        let base_exists = self.git.remote_branch_exists(checkout_dir, &base_branch);
        if base_exists.ok && base_exists.output == "false" {
            let push_base = self.git.push(checkout_dir, &base_branch);
            if !push_base.ok {
                self.fail_completion(project_id, checkout_dir, &push_base.error.unwrap_or_default())
                    .await;
                return;
            }
        }

        let push = self.git.push(checkout_dir, &project.working_branch);
        if !push.ok {
            self.fail_completion(project_id, checkout_dir, &push.error.unwrap_or_default())
                .await;
            return;
        }

        let body = build_pr_body(&completed, &blocked);
        let title = format!("ralphd: {}", project.name);
        let pr = self
            .git
            .create_pull_request(checkout_dir, &title, &body, &base_branch)
            .await;

        if pr.ok {
            let _ = self
                .state
                .update_project(project_id, |p| p.status = ProjectStatus::Completed)
                .await;
        } else {
            self.events
                .orchestrator_log(project_id, format!("pull request creation failed: {}", pr.error.unwrap_or_default()));
            let _ = self
                .state
                .update_project(project_id, |p| p.status = ProjectStatus::Failed)
                .await;
        }
        let _ = self.git.cleanup_workspace(checkout_dir);
    }

    async fn fail_completion(&self, project_id: Uuid, checkout_dir: &Path, error: &str) {
        self.events.orchestrator_log(project_id, format!("completion failed: {error}"));
        let _ = self
            .state
            .update_project(project_id, |p| p.status = ProjectStatus::Failed)
            .await;
        let _ = self.git.cleanup_workspace(checkout_dir);
    }

    fn task_log_path(&self, project_id: Uuid, task_id: Uuid, suffix: &str) -> PathBuf {
        self.logs_dir
            .join(project_id.to_string())
            .join(format!("{task_id}-{suffix}-{}.log", Utc::now().to_rfc3339()))
    }

    async fn append_task_log(&self, checkout_dir: &Path, task_id: Uuid, summary: String, success: bool) {
        if let Ok(mut document) = self.workspace.read_tasks(checkout_dir).await {
            if let Some(task) = document.tasks.iter_mut().find(|t| t.id == task_id) {
                task.logs.push(crate::model::TaskLogEntry {
                    timestamp: Utc::now(),
                    file_path: String::new(),
                    summary,
                    success,
                });
            }
            let _ = self.workspace.write_tasks(checkout_dir, &document).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_loop_log(
        &self,
        project_id: Uuid,
        checkout_dir: &Path,
        task_id: Option<Uuid>,
        action: &str,
        from: Option<String>,
        to: Option<String>,
        message: String,
    ) {
        let entry = LoopLogEntry {
            timestamp: Utc::now(),
            iteration: 0,
            task_id,
            action: action.to_string(),
            from,
            to,
            message: message.clone(),
        };
        let _ = self.workspace.append_log(checkout_dir, entry).await;
        self.events
            .publish(crate::engine::event_bus::EngineEvent::WorkspaceLogsChanged { project_id });
        self.events.orchestrator_log(project_id, message);
    }
}

/// Pick in order: `in_progress` (resume), then `verifying` (retry review),
/// then the lowest-priority `backlog` task, tie-broken by insertion order.
fn select_next_task(tasks: &[Task]) -> Option<Uuid> {
    if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::InProgress) {
        return Some(task.id);
    }
    if let Some(task) = tasks.iter().find(|t| t.status == TaskStatus::Verifying) {
        return Some(task.id);
    }
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Backlog)
        .min_by_key(|t| t.priority)
        .map(|t| t.id)
}

fn build_pr_body(completed: &[&Task], blocked: &[&Task]) -> String {
    let mut body = String::from("## Completed tasks\n\n");
    if completed.is_empty() {
        body.push_str("(none)\n");
    }
    for task in completed {
        body.push_str(&format!("- [x] {}\n", task.title));
    }
    body.push_str("\n## Blocked tasks\n\n");
    if blocked.is_empty() {
        body.push_str("(none)\n");
    }
    for task in blocked {
        body.push_str(&format!("- [ ] {}\n", task.title));
    }
    body
}
