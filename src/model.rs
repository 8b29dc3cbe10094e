//! Persisted data model shared by StateManager and WorkspaceStore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and provenance of a remote Git repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub remote_url: String,
    pub default_base_branch: String,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn owner_and_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

/// A unit of work inside a Repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub name: String,
    pub description: String,
    pub product_brief: Option<String>,
    pub solution_brief: Option<String>,
    pub base_branch: Option<String>,
    pub working_branch: String,
    pub status: ProjectStatus,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

    /// Derives `ralph/<slug(name)>-<epoch>`, the required working-branch format.
    pub fn derive_working_branch(name: &str, epoch_seconds: i64) -> String {
        format!("ralph/{}-{}", slugify(name), epoch_seconds)
    }
}

/// Lowercases, replaces runs of non-alphanumerics with `-`, trims leading/trailing `-`.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_dash = true; // swallow leading dashes
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("project");
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Verifying,
    Done,
    Blocked,
}

/// One log entry attached to a task, appended on each agent attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub summary: String,
    pub success: bool,
}

/// A discrete unit of work within a Project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub priority: i64,
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub verifying_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<TaskLogEntry>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            acceptance_criteria: Vec::new(),
            priority,
            status: TaskStatus::Backlog,
            attempts: 0,
            started_at: None,
            verifying_at: None,
            completed_at: None,
            logs: Vec::new(),
        }
    }
}

/// Singleton configuration record exposed by SettingsProvider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub max_parallel_projects: u32,
    pub max_task_attempts: u32,
    pub workspaces_path: std::path::PathBuf,
    pub agent_executable: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_projects: 3,
            max_task_attempts: 3,
            workspaces_path: default_data_dir().join("workspaces"),
            agent_executable: "claude".to_string(),
        }
    }
}

/// Platform-appropriate default for `<userData>`.
pub fn default_data_dir() -> std::path::PathBuf {
    if let Some(home) = dirs_home() {
        home.join(".local").join("share").join("ralphd")
    } else {
        std::path::PathBuf::from(".ralphd-data")
    }
}

fn dirs_home() -> Option<std::path::PathBuf> {
    std::env::var_os("HOME").map(std::path::PathBuf::from)
}

/// The top-level `state.json` document owned exclusively by StateManager.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSnapshot {
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

/// `.ralph/tasks.json` wire format: project context plus the authoritative task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceProjectContext {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub product_brief: Option<String>,
    pub solution_brief: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksDocument {
    pub project: WorkspaceProjectContext,
    pub tasks: Vec<Task>,
}

/// `.ralph/logs.json` wire format: the append-only loop log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopLogEntry {
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub task_id: Option<Uuid>,
    pub action: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogsDocument {
    pub entries: Vec<LoopLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("My Cool Project!!"), "my-cool-project");
        assert_eq!(slugify("  leading/trailing  "), "leading-trailing");
        assert_eq!(slugify("___"), "project");
    }

    #[test]
    fn working_branch_format_matches_contract() {
        let branch = Project::derive_working_branch("My Project", 1_700_000_000);
        assert_eq!(branch, "ralph/my-project-1700000000");
    }

    #[test]
    fn state_snapshot_round_trips_through_json() {
        let mut snapshot = StateSnapshot::default();
        snapshot.repositories.push(Repository {
            id: Uuid::new_v4(),
            name: "repo".into(),
            owner: "acme".into(),
            remote_url: "git@github.com:acme/repo.git".into(),
            default_base_branch: "main".into(),
            is_private: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StateSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.repositories.len(), 1);
        assert_eq!(back.repositories[0].name, "repo");
    }
}
