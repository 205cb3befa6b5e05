//! Shell process spawning.
//!
//! Every command runs through the platform shell (`sh -c` / `cmd.exe /c`)
//! so pipes, redirections and globbing behave as typed.

use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::error::SpawnError;
use crate::config::ExecConfig;

/// A started child process with all three pipes detached.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// OS process id.
    pub pid: u32,
    /// Process handle; the child is killed if this is dropped.
    pub child: Child,
    /// Writable standard input.
    pub stdin: ChildStdin,
    /// Readable standard output.
    pub stdout: ChildStdout,
    /// Readable standard error.
    pub stderr: ChildStderr,
}

/// Builds and starts shell commands.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    interactive_prefixes: Vec<String>,
    interactive_term: String,
}

impl ProcessSpawner {
    /// Create a spawner with explicit interactive settings.
    pub fn new(interactive_prefixes: Vec<String>, interactive_term: impl Into<String>) -> Self {
        Self {
            interactive_prefixes,
            interactive_term: interactive_term.into(),
        }
    }

    /// Create a spawner from the exec configuration.
    pub fn from_config(config: &ExecConfig) -> Self {
        Self::new(
            config.interactive_prefixes.clone(),
            config.interactive_term.clone(),
        )
    }

    /// Whether a command starts with one of the interactive tool prefixes.
    pub fn is_interactive(&self, cmd: &str) -> bool {
        let cmd = cmd.trim_start();
        self.interactive_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && cmd.starts_with(prefix.as_str()))
    }

    /// Build the shell command for `cmd` without any stdio wiring.
    pub fn command(&self, cmd: &str) -> Command {
        let mut command = shell_command(cmd);
        if self.is_interactive(cmd) {
            command.env("TERM", &self.interactive_term);
        }
        command.kill_on_drop(true);
        command
    }

    /// Start `cmd` with piped stdin, stdout and stderr.
    pub fn spawn(&self, cmd: &str) -> Result<SpawnedProcess, SpawnError> {
        let mut command = self.command(cmd);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(SpawnError::Launch)?;

        // Dropping `child` on any early return kills it.
        let stdin = child.stdin.take().ok_or(SpawnError::StdinPipe)?;
        let stdout = child.stdout.take().ok_or(SpawnError::StdoutPipe)?;
        let stderr = child.stderr.take().ok_or(SpawnError::StderrPipe)?;
        let pid = child.id().ok_or(SpawnError::NoPid)?;

        tracing::debug!(pid = pid, cmd = %cmd, "Spawned shell command");

        Ok(SpawnedProcess {
            pid,
            child,
            stdin,
            stdout,
            stderr,
        })
    }
}

/// The platform shell indirection for a command string.
fn shell_command(cmd: &str) -> Command {
    if cfg!(windows) {
        let mut command = Command::new("cmd.exe");
        command.arg("/c").arg(cmd);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }
}

/// Exit code and error text for a finished process.
///
/// The code is `-1` when the process did not exit normally (e.g. it was
/// killed by a signal). The text is empty on success.
pub fn describe_exit(status: &ExitStatus) -> (i32, String) {
    let code = status.code().unwrap_or(-1);
    if status.success() {
        (code, String::new())
    } else {
        (code, status.to_string())
    }
}
