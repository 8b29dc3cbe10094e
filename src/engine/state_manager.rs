//! Owns the persistent catalog of repositories, projects, and settings
//! (`state.json`): single writer, debounced persistence, and reload on
//! externally-detected mutation.
//!
//! Atomic temp-file-then-rename writes, `DefaultHasher` integrity checks,
//! and a `tokio::select!`-driven debounce loop, generalized from a workflow
//! checkpoint pattern to the engine's single `state.json` catalog, and
//! re-expressed as an explicit container rather than a singleton.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::engine::event_bus::{EngineEvent, EventBus};
use crate::model::{Project, ProjectStatus, Repository, Settings, StateSnapshot};

const DEBOUNCE: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("repository {0} not found")]
    RepositoryNotFound(Uuid),
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),
    #[error("repository {0} has projects referencing it")]
    HasDependents(Uuid),
    #[error("failed to parse state.json: {0}")]
    StateParseError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

pub struct StateManager {
    path: PathBuf,
    snapshot: RwLock<StateSnapshot>,
    last_written_hash: Mutex<u64>,
    events: EventBus,
    flush_tx: mpsc::UnboundedSender<()>,
}

impl StateManager {
    /// Loads `state.json` at `path` (falling back to empty defaults on any
    /// read/parse error) and spawns the
    /// debounced background writer.
    pub async fn load(path: impl Into<PathBuf>, events: EventBus) -> Arc<Self> {
        let path = path.into();
        let (snapshot, hash, migrated) = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(mut value) => {
                    let migrated = migrate_legacy_repo_urls(&mut value);
                    match serde_json::from_value::<StateSnapshot>(value) {
                        Ok(snapshot) => (snapshot, content_hash(&bytes), migrated),
                        Err(e) => {
                            tracing::warn!(error = %e, "state.json failed to parse; falling back to empty defaults");
                            (StateSnapshot::default(), 0, false)
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "state.json failed to parse; falling back to empty defaults");
                    (StateSnapshot::default(), 0, false)
                }
            },
            Err(_) => (StateSnapshot::default(), 0, false),
        };

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            path,
            snapshot: RwLock::new(snapshot),
            last_written_hash: Mutex::new(hash),
            events,
            flush_tx,
        });

        tokio::spawn(debounced_flush_loop(Arc::clone(&manager), flush_rx));
        if migrated {
            manager.request_flush();
        }
        manager
    }

    /// Returns a consistent copy of the full catalog, reloading first if an
    /// external writer has modified `state.json` since our last read.
    pub async fn get_state(&self) -> StateSnapshot {
        self.reload_if_externally_modified().await;
        self.snapshot.read().await.clone()
    }

    async fn reload_if_externally_modified(&self) {
        let Ok(bytes) = tokio::fs::read(&self.path).await else {
            return;
        };
        let on_disk_hash = content_hash(&bytes);
        let mut last_hash = self.last_written_hash.lock().await;
        if *last_hash == on_disk_hash {
            return;
        }
        let parsed = serde_json::from_slice::<serde_json::Value>(&bytes).and_then(|mut value| {
            let migrated = migrate_legacy_repo_urls(&mut value);
            serde_json::from_value::<StateSnapshot>(value).map(|snapshot| (snapshot, migrated))
        });
        match parsed {
            Ok((snapshot, migrated)) => {
                *self.snapshot.write().await = snapshot;
                *last_hash = on_disk_hash;
                drop(last_hash);
                self.events.publish(EngineEvent::StateChanged);
                if migrated {
                    self.request_flush();
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "external state.json modification failed to parse, ignoring");
            }
        }
    }

    pub async fn create_repository(&self, repository: Repository) -> Repository {
        let mut snapshot = self.snapshot.write().await;
        snapshot.repositories.push(repository.clone());
        drop(snapshot);
        self.request_flush();
        repository
    }

    pub async fn delete_repository(&self, id: Uuid) -> Result<(), StateError> {
        let mut snapshot = self.snapshot.write().await;
        if snapshot.projects.iter().any(|p| p.repository_id == id) {
            return Err(StateError::HasDependents(id));
        }
        let before = snapshot.repositories.len();
        snapshot.repositories.retain(|r| r.id != id);
        if snapshot.repositories.len() == before {
            return Err(StateError::RepositoryNotFound(id));
        }
        drop(snapshot);
        self.request_flush();
        Ok(())
    }

    pub async fn create_project(&self, input: ProjectInput) -> Project {
        let now = Utc::now();
        let epoch = now.timestamp();
        let project = Project {
            id: Uuid::new_v4(),
            repository_id: input.repository_id,
            name: input.name.clone(),
            description: input.description,
            product_brief: input.product_brief,
            solution_brief: input.solution_brief,
            base_branch: input.base_branch,
            working_branch: Project::derive_working_branch(&input.name, epoch),
            status: ProjectStatus::Idle,
            max_iterations: input.max_iterations.unwrap_or(Project::DEFAULT_MAX_ITERATIONS),
            current_iteration: 0,
            created_at: now,
            updated_at: now,
        };

        let mut snapshot = self.snapshot.write().await;
        snapshot.projects.push(project.clone());
        drop(snapshot);
        self.request_flush();
        project
    }

    pub async fn update_project<F>(&self, id: Uuid, patch: F) -> Result<Project, StateError>
    where
        F: FnOnce(&mut Project),
    {
        let mut snapshot = self.snapshot.write().await;
        let project = snapshot
            .projects
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StateError::ProjectNotFound(id))?;
        patch(project);
        project.updated_at = Utc::now();
        let updated = project.clone();
        drop(snapshot);
        self.request_flush();
        Ok(updated)
    }

    pub async fn delete_project(&self, id: Uuid) -> Result<(), StateError> {
        let mut snapshot = self.snapshot.write().await;
        let before = snapshot.projects.len();
        snapshot.projects.retain(|p| p.id != id);
        if snapshot.projects.len() == before {
            return Err(StateError::ProjectNotFound(id));
        }
        drop(snapshot);
        self.request_flush();
        Ok(())
    }

    pub async fn update_settings<F>(&self, patch: F)
    where
        F: FnOnce(&mut Settings),
    {
        let mut snapshot = self.snapshot.write().await;
        let mut settings = snapshot.settings.clone().unwrap_or_default();
        patch(&mut settings);
        snapshot.settings = Some(settings);
        drop(snapshot);
        self.request_flush();
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Request a debounced flush; coalesced with any other requests arriving
    /// within the debounce window by the background loop.
    fn request_flush(&self) {
        let _ = self.flush_tx.send(());
    }

    /// Writes the current snapshot to disk via temp-file-then-rename and
    /// publishes `StateChanged`. Exposed for callers (tests, `stop`) that
    /// need a synchronous guarantee the write has landed.
    pub async fn flush_now(&self) -> Result<(), StateError> {
        let snapshot = self.snapshot.read().await.clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StateError::StateParseError(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = self.path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&temp_path, &bytes).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        *self.last_written_hash.lock().await = content_hash(&bytes);
        self.events.publish(EngineEvent::StateChanged);
        Ok(())
    }
}

pub struct ProjectInput {
    pub repository_id: Uuid,
    pub name: String,
    pub description: String,
    pub product_brief: Option<String>,
    pub solution_brief: Option<String>,
    pub base_branch: Option<String>,
    pub max_iterations: Option<u32>,
}

async fn debounced_flush_loop(manager: Arc<StateManager>, mut flush_rx: mpsc::UnboundedReceiver<()>) {
    loop {
        if flush_rx.recv().await.is_none() {
            return; // all senders dropped (manager gone)
        }
        // Coalesce any additional requests that arrive during the debounce window.
        tokio::select! {
            _ = tokio::time::sleep(DEBOUNCE) => {}
            _ = drain_pending(&mut flush_rx) => {}
        }
        if let Err(e) = manager.flush_now().await {
            tracing::error!(error = %e, "failed to persist state.json");
        }
    }
}

/// Drains any signals already queued, then waits out the remainder of the
/// debounce window; returns early only if the channel closes.
async fn drain_pending(flush_rx: &mut mpsc::UnboundedReceiver<()>) {
    loop {
        tokio::select! {
            biased;
            signal = flush_rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(DEBOUNCE) => return,
        }
    }
}

/// Legacy Projects may carry an inline `repoUrl` instead of a
/// `repository_id` reference. Parses the `github.com[:/]<owner>/<name>(.git)?`
/// pattern, synthesizes the missing Repository, rewrites the project to
/// reference it, and drops the legacy field. Runs on the raw JSON `Value`
/// before typed deserialization, since `Project` has no field to hold
/// `repoUrl`. Returns whether anything was migrated, so the caller can
/// persist the rewritten file.
fn migrate_legacy_repo_urls(value: &mut serde_json::Value) -> bool {
    let mut migrated = false;
    let mut synthesized = Vec::new();

    if let Some(projects) = value.get_mut("projects").and_then(|p| p.as_array_mut()) {
        for project in projects.iter_mut() {
            let Some(object) = project.as_object_mut() else {
                continue;
            };
            let Some(repo_url) = object.get("repoUrl").and_then(|v| v.as_str()).map(str::to_string)
            else {
                continue;
            };

            if let Some((owner, name)) = parse_github_remote(&repo_url) {
                let repo_id = Uuid::new_v4();
                let now = Utc::now();
                synthesized.push(serde_json::json!({
                    "id": repo_id,
                    "name": name,
                    "owner": owner,
                    "remote_url": repo_url,
                    "default_base_branch": "main",
                    "is_private": false,
                    "created_at": now,
                    "updated_at": now,
                }));
                object.insert("repository_id".to_string(), serde_json::Value::String(repo_id.to_string()));
            }

            object.remove("repoUrl");
            migrated = true;
        }
    }

    if migrated && !synthesized.is_empty() {
        match value.get_mut("repositories").and_then(|r| r.as_array_mut()) {
            Some(repositories) => repositories.extend(synthesized),
            None => {
                if let Some(root) = value.as_object_mut() {
                    root.insert("repositories".to_string(), serde_json::Value::Array(synthesized));
                }
            }
        }
    }

    migrated
}

pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
    let re = regex::Regex::new(r"github\.com[:/]([^/]+)/([^/.]+)(?:\.git)?$").ok()?;
    let caps = re.captures(url.trim())?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

pub fn state_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("data").join("state.json")
}
