//! Execution and verification prompt templates.

use crate::model::{Task, TaskStatus};

/// Builds the execution prompt handed to AgentRunner for a task attempt.
///
/// Section order: Project Context, Solution Overview, Current Task,
/// Acceptance Criteria, Instructions, completion/blocker signal contract,
/// Other Tasks (context only), Important Notes.
pub fn execution_prompt(
    product_brief: Option<&str>,
    solution_brief: Option<&str>,
    task: &Task,
    other_tasks: &[Task],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("# Project Context\n\n");
    prompt.push_str(product_brief.unwrap_or("(no product brief provided)"));
    prompt.push_str("\n\n# Solution Overview\n\n");
    prompt.push_str(solution_brief.unwrap_or("(no solution brief provided)"));

    prompt.push_str("\n\n# Current Task\n\n");
    prompt.push_str(&format!("**{}**\n\n{}\n", task.title, task.description));

    prompt.push_str("\n# Acceptance Criteria\n\n");
    for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
    }

    prompt.push_str(
        "\n# Instructions\n\n\
         1. Read the relevant code before making changes.\n\
         2. Implement the task.\n\
         3. Run the project's tests and make sure they pass.\n\
         4. Commit your changes locally with `git add` and `git commit`.\n\n\
         When the task is fully done, end your output with exactly:\n\n\
         TASK_COMPLETE\n\n\
         If you cannot complete the task, end your output with exactly:\n\n\
         TASK_BLOCKED: <short reason>\n",
    );

    if !other_tasks.is_empty() {
        prompt.push_str("\n# Other Tasks (context only, do not work on these)\n\n");
        for other in other_tasks {
            prompt.push_str(&format!("- [{}] {}\n", status_label(other.status), other.title));
        }
    }

    prompt.push_str(
        "\n# Important Notes\n\n\
         - Stay scoped to the current task; do not touch unrelated files.\n\
         - Do not push to any remote or open a pull request yourself.\n\
         - Keep the existing test suite green.\n",
    );

    prompt
}

/// Builds the verification prompt for the self-review agent pass.
pub fn verification_prompt(
    task_title: &str,
    task_description: &str,
    acceptance_criteria: &[String],
    diff: &str,
    test_output: &str,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Task\n\n**{task_title}**\n\n{task_description}\n"));

    prompt.push_str("\n# Acceptance Criteria\n\n");
    for (i, criterion) in acceptance_criteria.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, criterion));
    }

    prompt.push_str("\n# Diff\n\n```diff\n");
    prompt.push_str(diff);
    prompt.push_str("\n```\n");

    prompt.push_str("\n# Test Output\n\n```\n");
    prompt.push_str(test_output);
    prompt.push_str("\n```\n");

    prompt.push_str(
        "\n# Verdict\n\n\
         Review the diff and test output against the acceptance criteria above. \
         End your output with exactly one of:\n\n\
         VERIFICATION_PASSED\n\n\
         or\n\n\
         VERIFICATION_FAILED: <short reason>\n",
    );

    prompt
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Backlog => "backlog",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Verifying => "verifying",
        TaskStatus::Done => "done",
        TaskStatus::Blocked => "blocked",
    }
}
