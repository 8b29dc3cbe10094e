use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

pub mod commands;

/// CLI-facing mirror of `model::TaskStatus`, accepted as a `--status` value.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TaskStatusArg {
    Backlog,
    InProgress,
    Verifying,
    Done,
    Blocked,
}

impl From<TaskStatusArg> for crate::model::TaskStatus {
    fn from(value: TaskStatusArg) -> Self {
        match value {
            TaskStatusArg::Backlog => crate::model::TaskStatus::Backlog,
            TaskStatusArg::InProgress => crate::model::TaskStatus::InProgress,
            TaskStatusArg::Verifying => crate::model::TaskStatus::Verifying,
            TaskStatusArg::Done => crate::model::TaskStatus::Done,
            TaskStatusArg::Blocked => crate::model::TaskStatus::Blocked,
        }
    }
}

#[derive(Parser)]
#[command(name = "ralphd")]
#[command(about = "Orchestration engine for autonomous coding agents")]
#[command(long_about = "ralphd drives a backlog of tasks against a git repository using an \
                       autonomous coding agent, verifying each change before committing and \
                       opening a pull request once the backlog is drained.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or persist the top-level state document
    #[command(subcommand)]
    State(StateCommands),
    /// Manage tracked repositories
    #[command(subcommand)]
    Repo(RepoCommands),
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommands),
    /// Manage a project's task backlog
    #[command(subcommand)]
    Task(TaskCommands),
    /// Control the orchestrator loop for a project
    #[command(subcommand)]
    Orchestrator(OrchestratorCommands),
    /// Read a project's workspace logs
    Logs { project_id: Uuid },
    /// Stream engine events to stdout until interrupted
    Watch {
        /// Only print events for this project
        #[arg(long)]
        project_id: Option<Uuid>,
    },
    /// GitHub CLI integration
    #[command(subcommand)]
    Github(GithubCommands),
}

#[derive(Subcommand)]
pub enum StateCommands {
    /// Print the current state snapshot as JSON
    Get,
    /// Force an immediate flush of the state snapshot to disk
    Save,
}

#[derive(Subcommand)]
pub enum RepoCommands {
    /// List tracked repositories
    List,
    /// Register a repository
    Create {
        name: String,
        owner: String,
        remote_url: String,
        #[arg(long, default_value = "main")]
        base_branch: String,
        #[arg(long)]
        private: bool,
    },
    /// Remove a repository (fails if any project still references it)
    Delete { id: Uuid },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// List all projects
    List,
    /// Print one project as JSON
    Get { id: Uuid },
    /// Create a project against a tracked repository
    Create {
        repository_id: Uuid,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        product_brief: Option<String>,
        #[arg(long)]
        solution_brief: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Update mutable fields of an existing project
    Update {
        id: Uuid,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        product_brief: Option<String>,
        #[arg(long)]
        solution_brief: Option<String>,
        #[arg(long)]
        base_branch: Option<String>,
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Delete a project
    Delete { id: Uuid },
    /// Clear a project's recorded loop logs
    ClearLogs { id: Uuid },
    /// Print a project's `.ralph/logs.json`
    WorkspaceLogs { id: Uuid },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// List a project's tasks
    List { project_id: Uuid },
    /// Print one task as JSON
    Get { project_id: Uuid, task_id: Uuid },
    /// Add a task to a project's backlog
    Create {
        project_id: Uuid,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "0")]
        priority: i64,
        #[arg(long = "criterion")]
        acceptance_criteria: Vec<String>,
    },
    /// Update mutable fields of an existing task
    Update {
        project_id: Uuid,
        task_id: Uuid,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long)]
        status: Option<TaskStatusArg>,
        #[arg(long = "criterion")]
        acceptance_criteria: Option<Vec<String>>,
    },
    /// Remove a task
    Delete { project_id: Uuid, task_id: Uuid },
    /// Reassign task priority to match the given ordering
    Reorder {
        project_id: Uuid,
        #[arg(required = true)]
        ordered_task_ids: Vec<Uuid>,
    },
}

#[derive(Subcommand)]
pub enum OrchestratorCommands {
    /// Start (or resume admission for) a project
    Start { project_id: Uuid },
    /// Request a project stop, reverting its in-progress task to backlog
    Stop { project_id: Uuid },
    /// Pause a running project after its current task attempt
    Pause { project_id: Uuid },
    /// Resume a paused project
    Resume { project_id: Uuid },
    /// Print the run state of every tracked project
    Status,
}

#[derive(Subcommand)]
pub enum GithubCommands {
    /// Check `gh` CLI authentication status
    AuthStatus,
    /// Launch `gh auth login --web`
    Login,
    /// List repositories visible to the authenticated account
    ListRepos,
}
