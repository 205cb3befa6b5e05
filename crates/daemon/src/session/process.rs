//! Registry of spawned processes for out-of-band input injection.
//!
//! Clients learn a pid from the `start` event and can later push raw
//! keystrokes into that process's standard input by pid.

use std::collections::HashMap;
use std::time::SystemTime;

use tokio::sync::RwLock;

use super::error::SessionError;
use super::input::InputHandle;

/// A live process tracked by pid.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    /// OS process id.
    pub pid: u32,
    /// Terminal that spawned the process.
    pub terminal_id: String,
    /// Command line the process was started with.
    pub command: String,
    /// When the process was started.
    pub started_at: SystemTime,
    /// Standard input, shared with the owning session.
    pub input: InputHandle,
}

impl ManagedProcess {
    /// Describe a process that was just started.
    pub fn new(
        pid: u32,
        terminal_id: impl Into<String>,
        command: impl Into<String>,
        input: InputHandle,
    ) -> Self {
        Self {
            pid,
            terminal_id: terminal_id.into(),
            command: command.into(),
            started_at: SystemTime::now(),
            input,
        }
    }
}

/// Concurrency-safe map from pid to [`ManagedProcess`].
///
/// Every operation takes the lock for the duration of the map access only;
/// input injection clones the handle out and writes after releasing it.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: RwLock<HashMap<u32, ManagedProcess>>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a process. Returns the entry it replaced, if any.
    pub async fn register(&self, process: ManagedProcess) -> Option<ManagedProcess> {
        let pid = process.pid;
        let previous = self.processes.write().await.insert(pid, process);
        if previous.is_some() {
            tracing::warn!(pid = pid, "Replaced an existing process registration");
        }
        previous
    }

    /// Look up a process by pid.
    pub async fn lookup(&self, pid: u32) -> Result<ManagedProcess, SessionError> {
        self.processes
            .read()
            .await
            .get(&pid)
            .cloned()
            .ok_or(SessionError::NotFound(pid))
    }

    /// Stop tracking a process. Returns whether an entry was removed.
    pub async fn remove(&self, pid: u32) -> bool {
        self.processes.write().await.remove(&pid).is_some()
    }

    /// Write raw input to a tracked process and flush it.
    pub async fn inject_input(&self, pid: u32, data: &[u8]) -> Result<(), SessionError> {
        let process = self.lookup(pid).await?;
        process.input.write(data).await?;
        tracing::debug!(pid = pid, bytes = data.len(), "Injected input");
        Ok(())
    }

    /// Whether a pid is tracked.
    pub async fn contains(&self, pid: u32) -> bool {
        self.processes.read().await.contains_key(&pid)
    }

    /// Number of tracked processes.
    pub async fn count(&self) -> usize {
        self.processes.read().await.len()
    }

    /// Snapshot of all tracked processes.
    pub async fn list(&self) -> Vec<ManagedProcess> {
        self.processes.read().await.values().cloned().collect()
    }
}
