//! Command trait for the CLI entry point.

use anyhow::Result;

/// Implemented by the CLI command.
///
/// `command_line` carries the full invocation for the output `@PG` record.
pub trait Command {
    /// Runs the command.
    fn execute(&self, command_line: &str) -> Result<()>;
}
