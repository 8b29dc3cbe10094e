//! Implements the on-disk contract between the engine and the agent: the
//! `.ralph/` coordination subdirectory inside a project's workspace.
//!
//! Built on the `FileSystemOperations` abstraction and the same atomic
//! temp-file-then-rename discipline used for `state.json`.
//! No in-memory cache is treated as authoritative over the file:
//! every read goes back to disk, since the agent subprocess is a second
//! writer of `tasks.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::fs::FileSystemOperations;
use crate::model::{LogsDocument, TasksDocument, WorkspaceProjectContext};

pub const RALPH_DIR: &str = ".ralph";
pub const TASKS_FILE: &str = "tasks.json";
pub const LOGS_FILE: &str = "logs.json";
pub const GITIGNORE_FILE: &str = ".gitignore";

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace missing at {0}")]
    WorkspaceMissing(PathBuf),
    #[error("failed to parse {0}: {1}")]
    ParseError(PathBuf, String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

pub struct WorkspaceStore {
    fs: Arc<dyn FileSystemOperations>,
}

impl WorkspaceStore {
    pub fn new(fs: Arc<dyn FileSystemOperations>) -> Self {
        Self { fs }
    }

    fn ralph_dir(workspace_dir: &Path) -> PathBuf {
        workspace_dir.join(RALPH_DIR)
    }

    fn tasks_path(workspace_dir: &Path) -> PathBuf {
        Self::ralph_dir(workspace_dir).join(TASKS_FILE)
    }

    fn logs_path(workspace_dir: &Path) -> PathBuf {
        Self::ralph_dir(workspace_dir).join(LOGS_FILE)
    }

    /// Idempotent: creates `.ralph/`, writes `.gitignore` containing `*`,
    /// and seeds empty `tasks.json`/`logs.json` only if they are absent.
    pub async fn initialize_ralph_folder(
        &self,
        workspace_dir: &Path,
        project: &WorkspaceProjectContext,
    ) -> Result<(), WorkspaceError> {
        let ralph_dir = Self::ralph_dir(workspace_dir);
        self.fs
            .create_dir_all(ralph_dir.to_str().unwrap_or_default())
            .await?;

        let gitignore_path = ralph_dir.join(GITIGNORE_FILE);
        if !self.fs.exists(gitignore_path.to_str().unwrap_or_default()) {
            self.fs
                .write(gitignore_path.to_str().unwrap_or_default(), b"*\n")
                .await?;
        }

        let tasks_path = Self::tasks_path(workspace_dir);
        if !self.fs.exists(tasks_path.to_str().unwrap_or_default()) {
            let empty = TasksDocument {
                project: project.clone(),
                tasks: Vec::new(),
            };
            let bytes = serde_json::to_vec_pretty(&empty)
                .map_err(|e| WorkspaceError::ParseError(tasks_path.clone(), e.to_string()))?;
            self.fs
                .write_atomic(tasks_path.to_str().unwrap_or_default(), &bytes)
                .await?;
        }

        let logs_path = Self::logs_path(workspace_dir);
        if !self.fs.exists(logs_path.to_str().unwrap_or_default()) {
            let empty = LogsDocument::default();
            let bytes = serde_json::to_vec_pretty(&empty)
                .map_err(|e| WorkspaceError::ParseError(logs_path.clone(), e.to_string()))?;
            self.fs
                .write_atomic(logs_path.to_str().unwrap_or_default(), &bytes)
                .await?;
        }

        Ok(())
    }

    pub async fn read_tasks(&self, workspace_dir: &Path) -> Result<TasksDocument, WorkspaceError> {
        let path = Self::tasks_path(workspace_dir);
        if !self.fs.exists(path.to_str().unwrap_or_default()) {
            return Err(WorkspaceError::WorkspaceMissing(path));
        }
        let bytes = self.fs.read(path.to_str().unwrap_or_default()).await?;
        serde_json::from_slice(&bytes).map_err(|e| WorkspaceError::ParseError(path, e.to_string()))
    }

    /// Atomic: write temp + rename. Readers either see the pre- or
    /// post-write content.
    pub async fn write_tasks(
        &self,
        workspace_dir: &Path,
        document: &TasksDocument,
    ) -> Result<(), WorkspaceError> {
        let ralph_dir = Self::ralph_dir(workspace_dir);
        self.fs
            .create_dir_all(ralph_dir.to_str().unwrap_or_default())
            .await?;
        let path = Self::tasks_path(workspace_dir);
        let bytes = serde_json::to_vec_pretty(document)
            .map_err(|e| WorkspaceError::ParseError(path.clone(), e.to_string()))?;
        self.fs
            .write_atomic(path.to_str().unwrap_or_default(), &bytes)
            .await?;
        Ok(())
    }

    pub async fn read_logs(&self, workspace_dir: &Path) -> Result<LogsDocument, WorkspaceError> {
        let path = Self::logs_path(workspace_dir);
        if !self.fs.exists(path.to_str().unwrap_or_default()) {
            return Ok(LogsDocument::default());
        }
        let bytes = self.fs.read(path.to_str().unwrap_or_default()).await?;
        serde_json::from_slice(&bytes).map_err(|e| WorkspaceError::ParseError(path, e.to_string()))
    }

    /// Truncates `logs.json` back to an empty document.
    pub async fn clear_logs(&self, workspace_dir: &Path) -> Result<(), WorkspaceError> {
        let path = Self::logs_path(workspace_dir);
        let bytes = serde_json::to_vec_pretty(&LogsDocument::default())
            .map_err(|e| WorkspaceError::ParseError(path.clone(), e.to_string()))?;
        self.fs
            .write_atomic(path.to_str().unwrap_or_default(), &bytes)
            .await?;
        Ok(())
    }

    pub async fn append_log(
        &self,
        workspace_dir: &Path,
        entry: crate::model::LoopLogEntry,
    ) -> Result<(), WorkspaceError> {
        let mut document = self.read_logs(workspace_dir).await.unwrap_or_default();
        document.entries.push(entry);
        let path = Self::logs_path(workspace_dir);
        let bytes = serde_json::to_vec_pretty(&document)
            .map_err(|e| WorkspaceError::ParseError(path.clone(), e.to_string()))?;
        self.fs
            .write_atomic(path.to_str().unwrap_or_default(), &bytes)
            .await?;
        Ok(())
    }
}

pub fn project_workspace_dir(workspaces_path: &Path, project_id: Uuid, repo_name: &str) -> PathBuf {
    workspaces_path.join(project_id.to_string()).join(repo_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StandardFileSystem;
    use crate::model::{Task, TaskStatus};

    fn sample_context() -> WorkspaceProjectContext {
        WorkspaceProjectContext {
            id: Uuid::new_v4(),
            name: "demo".to_string(),
            description: "desc".to_string(),
            product_brief: None,
            solution_brief: None,
        }
    }

    #[tokio::test]
    async fn initialize_ralph_folder_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(Arc::new(StandardFileSystem));
        let context = sample_context();

        store.initialize_ralph_folder(dir.path(), &context).await.unwrap();
        let gitignore = dir.path().join(RALPH_DIR).join(GITIGNORE_FILE);
        assert_eq!(tokio::fs::read_to_string(&gitignore).await.unwrap(), "*\n");

        // Write a task, then re-initialize: must not clobber existing tasks.json.
        let mut document = store.read_tasks(dir.path()).await.unwrap();
        document.tasks.push(Task::new("t1", "d1", 0));
        store.write_tasks(dir.path(), &document).await.unwrap();

        store.initialize_ralph_folder(dir.path(), &context).await.unwrap();
        let reloaded = store.read_tasks(dir.path()).await.unwrap();
        assert_eq!(reloaded.tasks.len(), 1);
    }

    #[tokio::test]
    async fn write_tasks_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(Arc::new(StandardFileSystem));
        let context = sample_context();
        store.initialize_ralph_folder(dir.path(), &context).await.unwrap();

        let mut document = store.read_tasks(dir.path()).await.unwrap();
        let mut task = Task::new("title", "desc", 1);
        task.status = TaskStatus::Backlog;
        document.tasks.push(task);
        store.write_tasks(dir.path(), &document).await.unwrap();

        let reloaded = store.read_tasks(dir.path()).await.unwrap();
        assert_eq!(reloaded.tasks.len(), 1);
        assert_eq!(reloaded.tasks[0].title, "title");
    }

    #[tokio::test]
    async fn read_tasks_without_workspace_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(Arc::new(StandardFileSystem));
        let result = store.read_tasks(dir.path()).await;
        assert!(matches!(result, Err(WorkspaceError::WorkspaceMissing(_))));
    }

    #[tokio::test]
    async fn append_log_preserves_prior_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorkspaceStore::new(Arc::new(StandardFileSystem));
        let context = sample_context();
        store.initialize_ralph_folder(dir.path(), &context).await.unwrap();

        for i in 0..3 {
            store
                .append_log(
                    dir.path(),
                    crate::model::LoopLogEntry {
                        timestamp: chrono::Utc::now(),
                        iteration: i,
                        task_id: None,
                        action: "iterate".to_string(),
                        from: None,
                        to: None,
                        message: format!("iteration {i}"),
                    },
                )
                .await
                .unwrap();
        }

        let logs = store.read_logs(dir.path()).await.unwrap();
        assert_eq!(logs.entries.len(), 3);
    }
}
