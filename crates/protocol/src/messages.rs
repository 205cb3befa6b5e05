//! Wire message definitions for Termexec.
//!
//! Every HTTP body and every event-stream payload exchanged between the
//! daemon and its clients is defined here. All messages are JSON with
//! camelCase field names.

use serde::{Deserialize, Serialize};

/// Terminal identifier reported when no session is live.
pub const DEFAULT_TERMINAL_ID: &str = "default";

/// Display name of the synthetic default terminal.
pub const DEFAULT_TERMINAL_NAME: &str = "Default";

/// Message carried by the `error` event when a stream is cancelled.
pub const CANCELLED_MESSAGE: &str = "Command cancelled";

// ============================================================================
// Terminal Descriptors
// ============================================================================

/// A terminal tab as advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Terminal {
    /// Client-chosen terminal identifier.
    pub terminal_id: String,
    /// Human readable name.
    pub terminal_name: String,
    /// Port serving the WebSocket bridge.
    pub ws_port: u16,
    /// Operating system of the daemon host.
    pub mode: String,
}

impl Terminal {
    /// Create a descriptor for the given id and name.
    pub fn new(terminal_id: impl Into<String>, terminal_name: impl Into<String>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            terminal_name: terminal_name.into(),
            ws_port: 0,
            mode: String::new(),
        }
    }

    /// The synthetic terminal reported when nothing is running.
    pub fn default_terminal() -> Self {
        Self::new(DEFAULT_TERMINAL_ID, DEFAULT_TERMINAL_NAME)
    }

    /// Fill in the host fields.
    pub fn with_host(mut self, ws_port: u16, mode: impl Into<String>) -> Self {
        self.ws_port = ws_port;
        self.mode = mode.into();
        self
    }
}

// ============================================================================
// Execution Requests
// ============================================================================

/// Request body for one-shot and streaming execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecRequest {
    /// Shell command text.
    pub cmd: String,
    /// Target terminal (streaming only).
    pub terminal_id: String,
    /// Display name for the terminal (streaming only).
    pub terminal_name: String,
}

impl ExecRequest {
    /// Build a streaming request for a terminal.
    pub fn for_terminal(cmd: impl Into<String>, terminal_id: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            terminal_id: terminal_id.into(),
            terminal_name: String::new(),
        }
    }

    /// The terminal id, falling back to the default terminal when empty.
    pub fn terminal_id(&self) -> &str {
        if self.terminal_id.is_empty() {
            DEFAULT_TERMINAL_ID
        } else {
            &self.terminal_id
        }
    }

    /// The display name, falling back to the terminal id when empty.
    pub fn terminal_name(&self) -> &str {
        if self.terminal_name.is_empty() {
            self.terminal_id()
        } else {
            &self.terminal_name
        }
    }
}

/// Result of a one-shot execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResponse {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Process exit code, `-1` when the process did not exit normally.
    pub exit_code: i32,
    /// Exit description; omitted on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Keystroke injection into a tracked process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    /// OS process id returned by the `start` event.
    pub pid: u32,
    /// Raw text written to the process's standard input.
    #[serde(default)]
    pub input: String,
}

/// Acknowledgement for a successful input injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAck {
    pub status: String,
}

impl InputAck {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

/// Request to tear down a terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminateRequest {
    pub terminal_id: String,
}

impl TerminateRequest {
    /// The terminal id, falling back to the default terminal when empty.
    pub fn terminal_id(&self) -> &str {
        if self.terminal_id.is_empty() {
            DEFAULT_TERMINAL_ID
        } else {
            &self.terminal_id
        }
    }
}

/// Readiness report for the host plugin layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStatus {
    pub ready: bool,
    pub version: String,
}

// ============================================================================
// Stream Events
// ============================================================================

/// One unit of the line-oriented streaming protocol.
///
/// For a single process instance the sequence is always one `Start`, any
/// number of `Stdout`/`Stderr`, then exactly one `End` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// The process was launched.
    Start { pid: u32 },
    /// A line read from standard output, without its terminator.
    Stdout { data: String },
    /// A line read from standard error, without its terminator.
    Stderr { data: String },
    /// The process exited.
    End {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(default)]
        error: String,
    },
    /// The stream was aborted.
    Error { data: String },
}

impl StreamEvent {
    /// The event emitted when a stream is cancelled.
    pub fn cancelled() -> Self {
        StreamEvent::Error {
            data: CANCELLED_MESSAGE.to_string(),
        }
    }

    /// Whether no further events follow this one for the same process.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End { .. } | StreamEvent::Error { .. })
    }
}
