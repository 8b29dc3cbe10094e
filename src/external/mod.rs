//! Trait-based abstractions for invoking external CLI tools.
//!
//! Separates pure decision logic from impure subprocess effects, so the
//! engine's components can be exercised against mock executors in tests.

pub mod command;

pub use command::{CommandError, CommandExecutor, CommandOutput, ExecOptions, ProcessCommandExecutor};
