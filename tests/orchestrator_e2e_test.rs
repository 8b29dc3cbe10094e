//! End-to-end coverage of the Orchestrator loop against a real (local,
//! network-free) git remote and a scripted stand-in for the code-agent CLI,
//! exercising the project lifecycle's literal end-to-end scenarios.
//! `AgentRunner` talks to whatever executable
//! `Settings::agent_executable` names over a PTY, so a small shell script
//! that mimics the real agent's completion/verdict markers drives the
//! Orchestrator exactly as the real CLI would, without any network access.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use git2::{Repository, Signature};
use ralphd::engine::event_bus::EventBus;
use ralphd::engine::git_driver::GitDriver;
use ralphd::engine::orchestrator::{Orchestrator, OrchestratorError};
use ralphd::engine::state_manager::{ProjectInput, StateManager};
use ralphd::engine::verifier::Verifier;
use ralphd::engine::workspace_store::{project_workspace_dir, WorkspaceStore};
use ralphd::engine::AgentRunner;
use ralphd::external::command::{CommandError, CommandExecutor, CommandOutput};
use ralphd::fs::StandardFileSystem;
use ralphd::model::{ProjectStatus, Repository as RalphRepository, TaskStatus};
use tempfile::TempDir;
use uuid::Uuid;

/// Stands in for the `gh` CLI: any `gh pr create` invocation succeeds, since
/// no real GitHub remote exists for this local-only fixture.
struct FakeGithubExecutor;

#[async_trait]
impl CommandExecutor for FakeGithubExecutor {
    async fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        if program == "gh" && args.first() == Some(&"pr") {
            return Ok(CommandOutput {
                status_code: 0,
                stdout: "https://example.invalid/acme/demo/pull/1\n".to_string(),
                stderr: String::new(),
            });
        }
        Err(CommandError::CommandNotFound {
            command: program.to_string(),
        })
    }
}

/// Creates a bare repo with a single commit on `main`, suitable as a
/// network-free `remote_url` for `GitDriver::clone_or_reuse`.
fn init_bare_upstream(path: &Path) {
    let repo = Repository::init_bare(path).unwrap();
    let signature = Signature::now("upstream", "upstream@example.invalid").unwrap();
    let blob_id = repo.blob(b"hello\n").unwrap();
    let mut builder = repo.treebuilder(None).unwrap();
    builder
        .insert("README.md", blob_id, git2::FileMode::Blob.into())
        .unwrap();
    let tree_id = builder.write().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(
        Some("refs/heads/main"),
        &signature,
        &signature,
        "initial commit",
        &tree,
        &[],
    )
    .unwrap();
    repo.set_head("refs/heads/main").unwrap();
}

/// The real `AgentRunner` always appends `-p <prompt> --permission-mode
/// bypassPermissions [--allowedTools ...] [--disallowedTools ...]`; `$2` is
/// the prompt. The verification prompt is the only one that embeds a
/// `# Diff` section, so a fake agent script uses that to tell the execution
/// and self-review passes apart.
const FAST_AGENT_SCRIPT: &str = r#"#!/bin/sh
prompt="$2"
case "$prompt" in
  *"# Diff"*)
    echo "VERIFICATION_PASSED"
    ;;
  *)
    echo "hello" > HELLO
    echo "TASK_COMPLETE"
    ;;
esac
"#;

/// Never terminates on its own; used to exercise cancellation, since the
/// fast script above completes before a `stop()` call could race it.
const HANGING_AGENT_SCRIPT: &str = r#"#!/bin/sh
sleep 60
echo "TASK_COMPLETE"
"#;

/// Always reports itself blocked, regardless of prompt; used to exercise the
/// blocked-after-retries scenario.
const BLOCKED_AGENT_SCRIPT: &str = r#"#!/bin/sh
echo "TASK_BLOCKED: missing credential"
"#;

/// Fails the first self-review pass, then passes every subsequent one.
/// Tracks the review count in a file next to the script itself, outside the
/// git checkout, so it never shows up in `git status`.
const FLAP_THEN_PASS_AGENT_SCRIPT: &str = r#"#!/bin/sh
script_dir="$(cd "$(dirname "$0")" && pwd)"
counter_file="$script_dir/review_count"
prompt="$2"
case "$prompt" in
  *"# Diff"*)
    count=0
    if [ -f "$counter_file" ]; then count=$(cat "$counter_file"); fi
    count=$((count+1))
    echo "$count" > "$counter_file"
    if [ "$count" -eq 1 ]; then
      echo "VERIFICATION_FAILED: tests missing"
    else
      echo "VERIFICATION_PASSED"
    fi
    ;;
  *)
    echo "hello" > HELLO
    echo "TASK_COMPLETE"
    ;;
esac
"#;

/// Writes a fake agent CLI to `path` and marks it executable.
fn write_fake_agent(path: &Path, script: &str) {
    std::fs::write(path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}

struct Harness {
    _upstream_dir: TempDir,
    workspaces_dir: TempDir,
    _logs_dir: TempDir,
    _state_dir: TempDir,
    _agent_script_dir: TempDir,
    state: Arc<StateManager>,
    orchestrator: Arc<Orchestrator>,
    project_id: Uuid,
    repository_name: String,
}

async fn build_harness(agent_script: &str) -> Harness {
    let upstream_dir = TempDir::new().unwrap();
    init_bare_upstream(upstream_dir.path());

    let workspaces_dir = TempDir::new().unwrap();
    let logs_dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let agent_script_dir = TempDir::new().unwrap();

    let agent_script_path = agent_script_dir.path().join("fake-agent.sh");
    write_fake_agent(&agent_script_path, agent_script);

    let events = EventBus::new();
    let state = StateManager::load(state_dir.path().join("state.json"), events.clone()).await;

    let repository = state
        .create_repository(RalphRepository {
            id: Uuid::new_v4(),
            name: "demo".to_string(),
            owner: "acme".to_string(),
            remote_url: upstream_dir.path().to_str().unwrap().to_string(),
            default_base_branch: "main".to_string(),
            is_private: false,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .await;

    let project = state
        .create_project(ProjectInput {
            repository_id: repository.id,
            name: "Demo Project".to_string(),
            description: "adds a file".to_string(),
            product_brief: Some("ship HELLO".to_string()),
            solution_brief: Some("write the file".to_string()),
            base_branch: None,
            max_iterations: Some(5),
        })
        .await;

    state
        .update_settings(|settings| {
            settings.max_parallel_projects = 1;
            settings.max_task_attempts = 3;
            settings.workspaces_path = workspaces_dir.path().to_path_buf();
            settings.agent_executable = agent_script_path.to_str().unwrap().to_string();
        })
        .await;

    let executor: Arc<dyn CommandExecutor> = Arc::new(FakeGithubExecutor);
    let git = Arc::new(GitDriver::new(Arc::clone(&executor)));
    let workspace = Arc::new(WorkspaceStore::new(Arc::new(StandardFileSystem)));
    let agent_runner = Arc::new(
        AgentRunner::new(agent_script_path.to_str().unwrap(), events.clone())
            .with_grace_period(Duration::from_millis(200)),
    );
    let verifier = Arc::new(Verifier::new(Arc::clone(&executor), Arc::clone(&agent_runner)));

    let orchestrator = Orchestrator::with_inter_iteration_sleep(
        Arc::clone(&state),
        workspace,
        git,
        agent_runner,
        verifier,
        events,
        workspaces_dir.path().to_path_buf(),
        logs_dir.path().to_path_buf(),
        Duration::from_millis(50),
    );

    Harness {
        _upstream_dir: upstream_dir,
        workspaces_dir,
        _logs_dir: logs_dir,
        _state_dir: state_dir,
        _agent_script_dir: agent_script_dir,
        state,
        orchestrator,
        project_id: project.id,
        repository_name: repository.name.clone(),
    }
}

fn workspace_dir(harness: &Harness) -> std::path::PathBuf {
    project_workspace_dir(harness.workspaces_dir.path(), harness.project_id, &harness.repository_name)
}

/// Polls `get_state` for the project to leave `Running`, bounded so a stuck
/// loop fails the test instead of hanging the suite.
async fn wait_for_terminal_status(harness: &Harness) -> ProjectStatus {
    for _ in 0..200 {
        let snapshot = harness.state.get_state().await;
        let project = snapshot
            .projects
            .iter()
            .find(|p| p.id == harness.project_id)
            .unwrap()
            .clone();
        if !matches!(project.status, ProjectStatus::Running) {
            return project.status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("project never reached a terminal status");
}

#[tokio::test]
async fn happy_path_single_task_completes_and_opens_a_pull_request() {
    let harness = build_harness(FAST_AGENT_SCRIPT).await;
    let checkout_dir = workspace_dir(&harness);
    assert!(!checkout_dir.exists(), "workspace should not exist before setup");

    harness.orchestrator.start(harness.project_id).await.unwrap();

    // Give `setup()` a moment to clone and lay down `.ralph/`, then inject
    // the one task the fake agent is scripted to complete.
    wait_for_tasks_file(&checkout_dir).await;
    let workspace = WorkspaceStore::new(Arc::new(StandardFileSystem));
    let mut document = workspace.read_tasks(&checkout_dir).await.unwrap();
    let mut task = ralphd::model::Task::new("Add HELLO file", "Create a file named HELLO", 0);
    task.acceptance_criteria.push("Adds a file named HELLO".to_string());
    document.tasks.push(task);
    workspace.write_tasks(&checkout_dir, &document).await.unwrap();

    let status = wait_for_terminal_status(&harness).await;
    assert_eq!(status, ProjectStatus::Completed);
    // Completion cleans up the checkout after pushing and opening the PR.
    assert!(!checkout_dir.exists());
}

/// Polls until `setup()` has cloned the repo and initialized `.ralph/`,
/// bounded so a broken clone fails fast instead of hanging the suite.
async fn wait_for_tasks_file(checkout_dir: &Path) {
    for _ in 0..100 {
        if checkout_dir.join(".ralph").join("tasks.json").exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("workspace was never initialized");
}

#[tokio::test]
async fn admission_cap_rejects_a_second_concurrent_start() {
    let harness = build_harness(FAST_AGENT_SCRIPT).await;
    harness.orchestrator.start(harness.project_id).await.unwrap();

    let result = harness.orchestrator.start(harness.project_id).await;
    assert!(matches!(result, Err(OrchestratorError::AlreadyRunning(_))));

    harness.orchestrator.stop(harness.project_id).await.unwrap();
    let statuses = harness.orchestrator.status().await;
    assert!(!statuses.contains_key(&harness.project_id));
}

/// Polls `.ralph/tasks.json` until `task_id` reaches `status`, bounded so a
/// loop that never picks the task up fails fast instead of hanging the suite.
async fn wait_for_task_status(checkout_dir: &Path, task_id: Uuid, status: TaskStatus) {
    let workspace = WorkspaceStore::new(Arc::new(StandardFileSystem));
    for _ in 0..200 {
        if let Ok(document) = workspace.read_tasks(checkout_dir).await {
            if let Some(task) = document.tasks.iter().find(|t| t.id == task_id) {
                if task.status == status {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached {status:?}");
}

/// Polls `.ralph/tasks.json` until `task_id` reaches `status`, then returns
/// a clone of that task so callers can assert on `attempts`/`completed_at`.
async fn wait_for_task(checkout_dir: &Path, task_id: Uuid, status: TaskStatus) -> ralphd::model::Task {
    let workspace = WorkspaceStore::new(Arc::new(StandardFileSystem));
    for _ in 0..200 {
        if let Ok(document) = workspace.read_tasks(checkout_dir).await {
            if let Some(task) = document.tasks.iter().find(|t| t.id == task_id) {
                if task.status == status {
                    return task.clone();
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached {status:?}");
}

#[tokio::test]
async fn task_blocked_after_max_attempts_fails_the_project() {
    let harness = build_harness(BLOCKED_AGENT_SCRIPT).await;
    let checkout_dir = workspace_dir(&harness);

    harness.orchestrator.start(harness.project_id).await.unwrap();
    wait_for_tasks_file(&checkout_dir).await;

    let workspace = WorkspaceStore::new(Arc::new(StandardFileSystem));
    let mut document = workspace.read_tasks(&checkout_dir).await.unwrap();
    let task = ralphd::model::Task::new("Needs credential", "cannot proceed without one", 0);
    let task_id = task.id;
    document.tasks.push(task);
    workspace.write_tasks(&checkout_dir, &document).await.unwrap();

    let blocked = wait_for_task(&checkout_dir, task_id, TaskStatus::Blocked).await;
    assert_eq!(blocked.attempts, 3, "blocked on the 3rd attempt per maxTaskAttempts");
    assert!(blocked.completed_at.is_some());

    let status = wait_for_terminal_status(&harness).await;
    assert_eq!(status, ProjectStatus::Failed, "no done tasks and one blocked task fails the project");
}

#[tokio::test]
async fn verification_flap_then_pass_completes_after_two_attempts() {
    let harness = build_harness(FLAP_THEN_PASS_AGENT_SCRIPT).await;
    let checkout_dir = workspace_dir(&harness);

    harness.orchestrator.start(harness.project_id).await.unwrap();
    wait_for_tasks_file(&checkout_dir).await;

    let workspace = WorkspaceStore::new(Arc::new(StandardFileSystem));
    let mut document = workspace.read_tasks(&checkout_dir).await.unwrap();
    let mut task = ralphd::model::Task::new("Add HELLO file", "Create a file named HELLO", 0);
    task.acceptance_criteria.push("Adds a file named HELLO".to_string());
    let task_id = task.id;
    document.tasks.push(task);
    workspace.write_tasks(&checkout_dir, &document).await.unwrap();

    let done = wait_for_task(&checkout_dir, task_id, TaskStatus::Done).await;
    assert_eq!(done.attempts, 2, "one failed review requeues the task for a second execution pass");

    let status = wait_for_terminal_status(&harness).await;
    assert_eq!(status, ProjectStatus::Completed);
}

#[tokio::test]
async fn stop_reverts_an_in_progress_task_to_backlog() {
    let harness = build_harness(HANGING_AGENT_SCRIPT).await;
    let checkout_dir = workspace_dir(&harness);

    harness.orchestrator.start(harness.project_id).await.unwrap();
    wait_for_tasks_file(&checkout_dir).await;

    let workspace = WorkspaceStore::new(Arc::new(StandardFileSystem));
    let mut document = workspace.read_tasks(&checkout_dir).await.unwrap();
    let task = ralphd::model::Task::new("Slow task", "never finishes", 0);
    let task_id = task.id;
    document.tasks.push(task);
    workspace.write_tasks(&checkout_dir, &document).await.unwrap();

    // Let the orchestrator pick the task up and hang inside `AgentRunner::run`
    // before requesting a stop, so the revert path actually has in-flight
    // state to unwind.
    wait_for_task_status(&checkout_dir, task_id, TaskStatus::InProgress).await;

    harness.orchestrator.stop(harness.project_id).await.unwrap();

    let reloaded = workspace.read_tasks(&checkout_dir).await.unwrap();
    let reverted = reloaded.tasks.iter().find(|t| t.id == task_id).unwrap();
    assert_eq!(reverted.status, TaskStatus::Backlog);
    assert!(reverted.started_at.is_none());
}
