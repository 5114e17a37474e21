//! Process supervision for CLI tools.
//!
//! The supervisor spawns one external process per session with piped
//! stdio and splits ownership of the pipes across dedicated tasks:
//!
//! ```text
//!                 ┌──────────────┐
//!  write() ──────▶│ stdin writer │──────▶ child stdin
//!                 └──────────────┘
//!                 ┌──────────────┐
//!  child stdout ─▶│ stdout reader│──┐
//!                 └──────────────┘  │   mpsc<OutputChunk>
//!                 ┌──────────────┐  ├──────────────────────▶ ProcessOutput::poll()
//!  child stderr ─▶│ stderr reader│──┤
//!                 └──────────────┘  │
//!                 ┌──────────────┐  │
//!  terminate() ──▶│    reaper    │──┘  Exited(ExitInfo), always last
//!                 └──────────────┘
//! ```
//!
//! The reaper owns the `Child`. It waits for either a natural exit or a
//! termination request (SIGTERM to the process group, then SIGKILL after
//! the grace period), lets the readers drain, and only then reports
//! `Exited`. Dropping the [`ProcessHandle`] counts as a termination
//! request with no grace, so a process can never outlive its session.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Pipe and channel failures end the affected task and are logged

mod process;

pub use process::{OutputChunk, ProcessHandle, ProcessOutput, ProcessSupervisor};

use std::io;

use thiserror::Error;

/// Errors returned when a process cannot be started.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    /// The executable does not exist (tool not installed).
    #[error("command not found: {command}")]
    CommandNotFound { command: String },

    /// The executable exists but may not be run.
    #[error("permission denied executing {command}")]
    PermissionDenied { command: String },

    /// Any other OS-level failure (fd or process limits, bad cwd, ...).
    #[error("failed to spawn {command}: {reason}")]
    Resource { command: String, reason: String },
}

impl SpawnError {
    /// Classifies an I/O error raised by `Command::spawn`.
    pub fn from_io(command: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::CommandNotFound {
                command: command.to_string(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                command: command.to_string(),
            },
            _ => Self::Resource {
                command: command.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Errors returned when writing to a process.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The process has exited or its stdin is closed.
    #[error("process has exited")]
    ProcessExited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_classification() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "nope");
        assert_eq!(
            SpawnError::from_io("claude", &not_found),
            SpawnError::CommandNotFound {
                command: "claude".to_string()
            }
        );

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(
            SpawnError::from_io("x", &denied),
            SpawnError::PermissionDenied { .. }
        ));

        let other = io::Error::other("too many open files");
        let err = SpawnError::from_io("x", &other);
        assert!(matches!(err, SpawnError::Resource { .. }));
        assert!(err.to_string().contains("too many open files"));
    }
}
