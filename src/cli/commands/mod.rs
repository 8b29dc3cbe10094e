//! Dispatches parsed CLI subcommands straight through to `engine::api::Engine`,
//! printing results as pretty JSON. This is one of two realizations of the
//! same IPC surface — the other being `engine::api` itself, which a future
//! UI/bridge process would call without modification.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::cli::{
    Cli, Commands, GithubCommands, OrchestratorCommands, ProjectCommands, RepoCommands,
    StateCommands, TaskCommands,
};
use crate::engine::api::Engine;
use crate::engine::state_manager::ProjectInput;
use crate::model::{Repository, Task};

pub async fn run(cli: Cli, engine: Arc<Engine>) -> Result<()> {
    match cli.command {
        Commands::State(cmd) => run_state(cmd, &engine).await,
        Commands::Repo(cmd) => run_repo(cmd, &engine).await,
        Commands::Project(cmd) => run_project(cmd, &engine).await,
        Commands::Task(cmd) => run_task(cmd, &engine).await,
        Commands::Orchestrator(cmd) => run_orchestrator(cmd, &engine).await,
        Commands::Logs { project_id } => print_json(&engine.logs_get(project_id).await?),
        Commands::Watch { project_id } => watch(&engine, project_id).await,
        Commands::Github(cmd) => run_github(cmd, &engine).await,
    }
}

async fn run_state(cmd: StateCommands, engine: &Engine) -> Result<()> {
    match cmd {
        StateCommands::Get => print_json(&engine.state_get().await),
        StateCommands::Save => {
            engine.state_save().await?;
            println!("state saved");
            Ok(())
        }
    }
}

async fn run_repo(cmd: RepoCommands, engine: &Engine) -> Result<()> {
    match cmd {
        RepoCommands::List => print_json(&engine.repository_list().await),
        RepoCommands::Create {
            name,
            owner,
            remote_url,
            base_branch,
            private,
        } => {
            let now = Utc::now();
            let repository = engine
                .repository_create(Repository {
                    id: Uuid::new_v4(),
                    name,
                    owner,
                    remote_url,
                    default_base_branch: base_branch,
                    is_private: private,
                    created_at: now,
                    updated_at: now,
                })
                .await;
            print_json(&repository)
        }
        RepoCommands::Delete { id } => {
            engine.repository_delete(id).await?;
            println!("repository {id} deleted");
            Ok(())
        }
    }
}

async fn run_project(cmd: ProjectCommands, engine: &Engine) -> Result<()> {
    match cmd {
        ProjectCommands::List => print_json(&engine.project_list().await),
        ProjectCommands::Get { id } => {
            let project = engine
                .project_get(id)
                .await
                .ok_or_else(|| anyhow!("project {id} not found"))?;
            print_json(&project)
        }
        ProjectCommands::Create {
            repository_id,
            name,
            description,
            product_brief,
            solution_brief,
            base_branch,
            max_iterations,
        } => {
            let project = engine
                .project_create(ProjectInput {
                    repository_id,
                    name,
                    description,
                    product_brief,
                    solution_brief,
                    base_branch,
                    max_iterations,
                })
                .await;
            print_json(&project)
        }
        ProjectCommands::Update {
            id,
            name,
            description,
            product_brief,
            solution_brief,
            base_branch,
            max_iterations,
        } => {
            let project = engine
                .project_update(id, |p| {
                    if let Some(name) = name {
                        p.name = name;
                    }
                    if let Some(description) = description {
                        p.description = description;
                    }
                    if product_brief.is_some() {
                        p.product_brief = product_brief;
                    }
                    if solution_brief.is_some() {
                        p.solution_brief = solution_brief;
                    }
                    if base_branch.is_some() {
                        p.base_branch = base_branch;
                    }
                    if let Some(max_iterations) = max_iterations {
                        p.max_iterations = max_iterations;
                    }
                })
                .await?;
            print_json(&project)
        }
        ProjectCommands::Delete { id } => {
            engine.project_delete(id).await?;
            println!("project {id} deleted");
            Ok(())
        }
        ProjectCommands::ClearLogs { id } => {
            engine.project_clear_loop_logs(id).await?;
            println!("cleared loop logs for project {id}");
            Ok(())
        }
        ProjectCommands::WorkspaceLogs { id } => {
            print_json(&engine.project_get_workspace_logs(id).await?)
        }
    }
}

async fn run_task(cmd: TaskCommands, engine: &Engine) -> Result<()> {
    match cmd {
        TaskCommands::List { project_id } => print_json(&engine.task_list(project_id).await?),
        TaskCommands::Get { project_id, task_id } => {
            print_json(&engine.task_get(project_id, task_id).await?)
        }
        TaskCommands::Create {
            project_id,
            title,
            description,
            priority,
            acceptance_criteria,
        } => {
            let mut task = Task::new(&title, &description, priority);
            task.acceptance_criteria = acceptance_criteria;
            print_json(&engine.task_create(project_id, task).await?)
        }
        TaskCommands::Update {
            project_id,
            task_id,
            title,
            description,
            priority,
            status,
            acceptance_criteria,
        } => {
            let task = engine
                .task_update(project_id, task_id, |t| {
                    if let Some(title) = title {
                        t.title = title;
                    }
                    if let Some(description) = description {
                        t.description = description;
                    }
                    if let Some(priority) = priority {
                        t.priority = priority;
                    }
                    if let Some(status) = status {
                        t.status = status.into();
                    }
                    if let Some(acceptance_criteria) = acceptance_criteria {
                        t.acceptance_criteria = acceptance_criteria;
                    }
                })
                .await?;
            print_json(&task)
        }
        TaskCommands::Delete { project_id, task_id } => {
            engine.task_delete(project_id, task_id).await?;
            println!("task {task_id} deleted");
            Ok(())
        }
        TaskCommands::Reorder { project_id, ordered_task_ids } => {
            engine.task_reorder(project_id, &ordered_task_ids).await?;
            println!("reordered {} tasks", ordered_task_ids.len());
            Ok(())
        }
    }
}

async fn run_orchestrator(cmd: OrchestratorCommands, engine: &Arc<Engine>) -> Result<()> {
    match cmd {
        OrchestratorCommands::Start { project_id } => {
            engine.orchestrator_start(project_id).await?;
            println!("started project {project_id}");
            Ok(())
        }
        OrchestratorCommands::Stop { project_id } => {
            engine.orchestrator_stop(project_id).await?;
            println!("stopped project {project_id}");
            Ok(())
        }
        OrchestratorCommands::Pause { project_id } => {
            engine.orchestrator_pause(project_id).await?;
            println!("paused project {project_id}");
            Ok(())
        }
        OrchestratorCommands::Resume { project_id } => {
            engine.orchestrator_resume(project_id).await?;
            println!("resumed project {project_id}");
            Ok(())
        }
        OrchestratorCommands::Status => print_json(&engine.orchestrator_status().await),
    }
}

async fn run_github(cmd: GithubCommands, engine: &Engine) -> Result<()> {
    match cmd {
        GithubCommands::AuthStatus => {
            let authenticated = engine.github_auth_status().await?;
            println!("{}", if authenticated { "authenticated" } else { "not authenticated" });
            Ok(())
        }
        GithubCommands::Login => {
            engine.github_login().await?;
            println!("logged in");
            Ok(())
        }
        GithubCommands::ListRepos => print_json(&engine.github_list_repos().await?),
    }
}

/// Drains the engine's broadcast channel to stdout, one JSON line per event,
/// until interrupted. Exercises the same subscription surface a UI window
/// would use.
async fn watch(engine: &Engine, project_id: Option<Uuid>) -> Result<()> {
    let mut receiver = engine.events.subscribe();
    loop {
        match receiver.recv().await {
            Ok(event) => {
                if let Some(filter) = project_id {
                    if event_project_id(&event) != Some(filter) {
                        continue;
                    }
                }
                println!("{}", serde_json::to_string(&event)?);
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("watch: skipped {skipped} events, channel lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

fn event_project_id(event: &crate::engine::event_bus::EngineEvent) -> Option<Uuid> {
    use crate::engine::event_bus::EngineEvent;
    match event {
        EngineEvent::StateChanged => None,
        EngineEvent::LogUpdate { project_id, .. } => Some(*project_id),
        EngineEvent::OrchestratorLog { project_id, .. } => Some(*project_id),
        EngineEvent::WorkspaceLogsChanged { project_id } => Some(*project_id),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
