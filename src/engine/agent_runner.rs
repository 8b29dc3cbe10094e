//! Runs the code-agent CLI as a supervised child process under a
//! pseudo-terminal.
//!
//! Process lifecycle (SIGTERM-then-grace-period termination, background
//! output draining, cancellation-aware cleanup) follows the usual supervised
//! child process pattern. The 120x30 PTY requirement is implemented with
//! `portable-pty`, the same crate used for interactive subprocess sessions
//! by the closest-fit sibling repos in the wider example pack (the Codex
//! CLI fork's `exec_command` session manager, and the Ralph-pattern
//! orchestrators `ralph-commander`/`compound-ralph`). The PTY read API is
//! synchronous, so the master's reader is drained on a blocking task
//! bridged into the async world via an `mpsc` channel, isolating a
//! blocking resource behind an async-friendly boundary.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::event_bus::{EngineEvent, EventBus};
use crate::observability::engine_metrics;

pub const PTY_ROWS: u16 = 30;
pub const PTY_COLS: u16 = 120;

/// Grace period between SIGTERM and SIGKILL for a cancelled agent process.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub project_id: Uuid,
    pub task_id: Uuid,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub log_file_path: PathBuf,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub ok: bool,
    pub combined_output: String,
    pub task_complete: bool,
    pub task_blocked: bool,
    pub blocked_reason: Option<String>,
    pub stopped: bool,
    /// OS process id of the spawned agent, when the platform reports one.
    pub pid: Option<u32>,
}

pub struct AgentRunner {
    agent_executable: String,
    grace_period: Duration,
    events: EventBus,
}

impl AgentRunner {
    pub fn new(agent_executable: impl Into<String>, events: EventBus) -> Self {
        Self {
            agent_executable: agent_executable.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            events,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Invoke the agent under a 120x30 PTY, stream its combined output to
    /// `spec.log_file_path` and the EventBus, and parse completion markers.
    pub async fn run(&self, spec: ProcessSpec, cancel: CancellationToken) -> anyhow::Result<Outcome> {
        engine_metrics().record_agent_invocation();
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: PTY_ROWS,
            cols: PTY_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(&self.agent_executable);
        cmd.arg("-p");
        cmd.arg(&spec.prompt);
        cmd.arg("--permission-mode");
        cmd.arg("bypassPermissions");
        for tool in &spec.allowed_tools {
            cmd.arg("--allowedTools");
            cmd.arg(tool);
        }
        for tool in &spec.disallowed_tools {
            cmd.arg("--disallowedTools");
            cmd.arg(tool);
        }
        cmd.cwd(&spec.working_directory);
        cmd.env("NO_COLOR", "1");
        cmd.env("FORCE_COLOR", "0");

        let mut child = pair.slave.spawn_command(cmd)?;
        drop(pair.slave);
        let pid = child.process_id();

        let mut reader = pair.master.try_clone_reader()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // The PTY read API is blocking; drain it on a dedicated thread and
        // forward lines into the async world over an unbounded channel.
        let reader_handle = std::thread::spawn(move || {
            let mut buffered = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match buffered.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(line.clone()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        if let Some(parent) = spec.log_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut log_file = tokio::fs::File::create(&spec.log_file_path).await?;
        let header = format!(
            "--- agent run started {} ---\nproject: {}\ntask: {}\nworking directory: {}\nprompt:\n{}\n--- output ---\n",
            chrono::Utc::now().to_rfc3339(),
            spec.project_id,
            spec.task_id,
            spec.working_directory.display(),
            spec.prompt,
        );
        log_file.write_all(header.as_bytes()).await?;
        let mut combined_output = String::new();

        let mut killer = child.clone_killer();
        let wait_for_output = async {
            while let Some(chunk) = rx.recv().await {
                combined_output.push_str(&chunk);
                let _ = log_file.write_all(chunk.as_bytes()).await;
                self.events.publish(EngineEvent::LogUpdate {
                    project_id: spec.project_id,
                    task_id: spec.task_id,
                    chunk,
                });
            }
        };

        let stopped = tokio::select! {
            _ = wait_for_output => false,
            _ = cancel.cancelled() => {
                terminate_with_grace_period(&mut *child, killer.as_mut(), pid, self.grace_period).await;
                true
            }
        };

        let _ = reader_handle.join();

        let exit_code = if stopped {
            None
        } else {
            child.wait().ok().map(|status| status.exit_code())
        };
        let exit_ok = !stopped && exit_code == Some(0);

        let footer = format!(
            "--- agent run ended {} ---\nexit code: {}\nstopped: {stopped}\n",
            chrono::Utc::now().to_rfc3339(),
            exit_code.map(|c| c.to_string()).unwrap_or_else(|| "n/a".to_string()),
        );
        let _ = log_file.write_all(footer.as_bytes()).await;
        let _ = log_file.flush().await;

        let (task_blocked, blocked_reason) = parse_blocked(&combined_output);
        let task_complete = !stopped && combined_output.contains("TASK_COMPLETE") && !task_blocked;

        if task_blocked {
            engine_metrics().record_agent_blocked();
        } else if !exit_ok {
            engine_metrics().record_agent_failure();
        }

        Ok(Outcome {
            ok: exit_ok,
            combined_output,
            task_complete,
            task_blocked,
            blocked_reason,
            stopped,
            pid,
        })
    }
}

/// Sends SIGTERM to the agent process and waits out `grace_period` for it to
/// exit on its own, polling `child.try_wait()`; only escalates to SIGKILL
/// (via the PTY killer) once the grace window elapses with the process still
/// alive. On non-Unix targets there is no portable way to send SIGTERM
/// through `portable-pty`, so the grace period is honored as a plain wait
/// before the hard kill.
async fn terminate_with_grace_period(
    child: &mut (dyn portable_pty::Child + Send + Sync),
    killer: &mut (dyn portable_pty::ChildKiller + Send + Sync),
    pid: Option<u32>,
    grace_period: Duration,
) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + grace_period;
        while tokio::time::Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child;
        tokio::time::sleep(grace_period).await;
    }

    let _ = killer.kill();
}

fn parse_blocked(output: &str) -> (bool, Option<String>) {
    let blocked = output.contains("TASK_BLOCKED") || output.contains("BLOCKED");
    if !blocked {
        return (false, None);
    }

    let task_blocked_re = Regex::new(r"TASK_BLOCKED:\s*(.+)").expect("valid regex");
    if let Some(captures) = task_blocked_re.captures(output) {
        return (true, Some(captures[1].trim().to_string()));
    }

    let blocked_re = Regex::new(r"BLOCKED:\s*(.+)").expect("valid regex");
    if let Some(captures) = blocked_re.captures(output) {
        return (true, Some(captures[1].trim().to_string()));
    }

    (true, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blocked_prefers_task_blocked_reason() {
        let output = "some log\nTASK_BLOCKED: missing API key\nBLOCKED: generic\n";
        let (blocked, reason) = parse_blocked(output);
        assert!(blocked);
        assert_eq!(reason.as_deref(), Some("missing API key"));
    }

    #[test]
    fn parse_blocked_falls_back_to_bare_blocked() {
        let output = "oops\nBLOCKED: out of disk space\n";
        let (blocked, reason) = parse_blocked(output);
        assert!(blocked);
        assert_eq!(reason.as_deref(), Some("out of disk space"));
    }

    #[test]
    fn parse_blocked_returns_false_when_absent() {
        let output = "all good\nTASK_COMPLETE\n";
        let (blocked, reason) = parse_blocked(output);
        assert!(!blocked);
        assert_eq!(reason, None);
    }

    #[test]
    fn task_complete_requires_no_block_marker() {
        let both = "TASK_COMPLETE\nTASK_BLOCKED: actually no\n";
        let (blocked, _) = parse_blocked(both);
        assert!(blocked, "blocked marker dominates per spec");
    }
}
