//! Error types for subprocess execution

use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pump::PumpRole;

/// A process ran to completion and exited with a non-zero code.
///
/// Carries everything needed to reconstruct what ran, where, and why it
/// failed without re-running it. The rendered form lists the exit code, the
/// working directory, the command line and the captured stderr, in that order.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("[{exit_code}] {}$ {}\n{stderr}", .path.display(), render_command(.command))]
pub struct SubprocessFailure {
    /// Program and arguments, in order
    pub command: Vec<String>,
    /// Numeric exit code reported by the process
    pub exit_code: i32,
    /// Absolute working-directory path
    pub path: PathBuf,
    /// Everything the process wrote to stderr, decoded as text
    pub stderr: String,
}

impl SubprocessFailure {
    #[must_use]
    pub fn new(command: Vec<String>, exit_code: i32, path: PathBuf, stderr: String) -> Self {
        Self {
            command,
            exit_code,
            path,
            stderr,
        }
    }
}

fn render_command(command: &[String]) -> String {
    format!("[{}]", command.join(", "))
}

/// Subprocess execution errors
#[derive(Error, Debug)]
pub enum SubprocessError {
    #[error("Working directory not found: {}", .path.display())]
    DirectoryNotFound { path: PathBuf },

    #[error("Command line is empty")]
    EmptyCommand,

    #[error("Failed to spawn process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{role} pump failed: {source}")]
    Pump {
        role: PumpRole,
        #[source]
        source: io::Error,
    },

    #[error("Failed to wait for process '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Failed(#[from] SubprocessFailure),

    #[error("Execution timed out after {} ms: {}", .timeout.as_millis(), render_command(.command))]
    Timeout {
        command: Vec<String>,
        timeout: Duration,
    },

    #[error("Execution cancelled: {}", render_command(.command))]
    Cancelled { command: Vec<String> },

    #[error("Unsupported text encoding: {name}")]
    UnsupportedEncoding { name: String },
}

impl SubprocessError {
    /// Exit code of the child, when the error is a non-zero exit.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed(failure) => Some(failure.exit_code),
            _ => None,
        }
    }

    /// The structured failure, when the error is a non-zero exit.
    #[must_use]
    pub fn as_failure(&self) -> Option<&SubprocessFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
