//! Error types for the session engine.

use std::io;

use thiserror::Error;

/// Failures while launching a child process.
///
/// Each step of process creation reports its own variant so callers can tell
/// which resource could not be set up.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The OS refused to start the process.
    #[error("failed to start command: {0}")]
    Launch(#[source] io::Error),

    /// The standard input pipe was not created.
    #[error("failed to create stdin pipe")]
    StdinPipe,

    /// The standard output pipe was not created.
    #[error("failed to create stdout pipe")]
    StdoutPipe,

    /// The standard error pipe was not created.
    #[error("failed to create stderr pipe")]
    StderrPipe,

    /// The process exited before its id could be read.
    #[error("process exited before its pid was known")]
    NoPid,
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// No tracked process has the given pid.
    #[error("process not found: {0}")]
    NotFound(u32),

    /// Failed to spawn the process.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Failed to write to the process input.
    #[error("failed to write to process stdin: {0}")]
    WriteFailed(String),

    /// Failed to set up or drive the pseudo-terminal.
    #[error("pty error: {0}")]
    PtyFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
