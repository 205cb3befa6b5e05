//! Pseudo-terminal bridge.
//!
//! Spawns a shell under a PTY and copies raw bytes between the terminal
//! device and a pair of byte channels. There is no framing and no line
//! discipline on top; the transport adapter decides how chunks travel.

use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use super::error::SessionError;

/// Largest chunk forwarded from the terminal in one message.
pub const PTY_CHUNK_SIZE: usize = 1024;

/// Terminal type advertised to the shell.
const PTY_TERM: &str = "xterm-256color";

/// A shell running under a pseudo-terminal, not yet bridged.
pub struct PtyBridge {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl PtyBridge {
    /// Spawn `shell` on a fresh PTY of the given size.
    pub fn spawn(shell: &str, cols: u16, rows: u16) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", PTY_TERM);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::PtyFailed(e.to_string()))?;
        // The child owns the slave now; keeping ours open would hide EOF.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::PtyFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::PtyFailed(e.to_string()))?;

        let pid = child.process_id();
        tracing::info!(pid = ?pid, shell = %shell, cols, rows, "PTY bridge opened");

        Ok(Self {
            master: pair.master,
            reader,
            writer,
            child,
            pid,
        })
    }

    /// Process id of the shell, if the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Bridge until either direction ends, then kill the shell.
    ///
    /// `inbound` carries bytes for the terminal's input; terminal output is
    /// sent on `outbound` in chunks of at most [`PTY_CHUNK_SIZE`] bytes.
    pub async fn run(self, inbound: mpsc::Receiver<Vec<u8>>, outbound: mpsc::Sender<Vec<u8>>) {
        let Self {
            master,
            reader,
            writer,
            mut child,
            pid,
        } = self;

        let mut output = tokio::task::spawn_blocking(move || copy_output(reader, outbound));
        let mut input = tokio::spawn(copy_input(inbound, writer));

        tokio::select! {
            _ = &mut output => {
                tracing::debug!(pid = ?pid, "PTY output ended");
            }
            _ = &mut input => {
                tracing::debug!(pid = ?pid, "PTY input ended");
            }
        }

        input.abort();
        if let Err(e) = child.kill() {
            tracing::debug!(pid = ?pid, error = %e, "Shell already exited");
        }
        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        drop(master);

        match status {
            Ok(Ok(status)) => {
                tracing::info!(pid = ?pid, exit_code = status.exit_code(), "PTY bridge closed");
            }
            Ok(Err(e)) => tracing::warn!(pid = ?pid, error = %e, "Failed to reap PTY shell"),
            Err(e) => tracing::warn!(pid = ?pid, error = %e, "PTY reaper task failed"),
        }
    }
}

/// Copy terminal output to `outbound` until EOF, a read error, or the
/// receiver going away. Runs on a blocking thread.
fn copy_output(mut reader: Box<dyn Read + Send>, outbound: mpsc::Sender<Vec<u8>>) {
    let mut buffer = [0u8; PTY_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if outbound.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                // EIO once the shell is gone on Linux.
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }
}

async fn copy_input(mut inbound: mpsc::Receiver<Vec<u8>>, mut writer: Box<dyn Write + Send>) {
    while let Some(data) = inbound.recv().await {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(error = %e, "PTY write failed");
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn read_until(rx: &mut mpsc::Receiver<Vec<u8>>, needle: &str) -> String {
        let mut seen = Vec::new();
        while let Some(chunk) = rx.recv().await {
            assert!(chunk.len() <= PTY_CHUNK_SIZE);
            seen.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&seen).contains(needle) {
                break;
            }
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[tokio::test]
    async fn test_bridge_round_trip() {
        let bridge = PtyBridge::spawn("/bin/sh", 80, 24).unwrap();
        assert!(bridge.pid().is_some());

        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = tokio::spawn(bridge.run(in_rx, out_tx));

        in_tx.send(b"echo bridge-$((40+2))\n".to_vec()).await.unwrap();
        let output = timeout(Duration::from_secs(5), read_until(&mut out_rx, "bridge-42"))
            .await
            .unwrap();
        assert!(output.contains("bridge-42"));

        drop(in_tx);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bridge_sets_term() {
        let bridge = PtyBridge::spawn("/bin/sh", 80, 24).unwrap();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let handle = tokio::spawn(bridge.run(in_rx, out_tx));

        in_tx.send(b"echo term=$TERM\n".to_vec()).await.unwrap();
        let output = timeout(
            Duration::from_secs(5),
            read_until(&mut out_rx, "term=xterm-256color"),
        )
        .await
        .unwrap();
        assert!(output.contains("term=xterm-256color"));

        drop(in_tx);
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shell_exit_ends_bridge() {
        let bridge = PtyBridge::spawn("/bin/sh", 80, 24).unwrap();
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let handle = tokio::spawn(bridge.run(in_rx, out_tx));

        in_tx.send(b"exit\n".to_vec()).await.unwrap();
        // Drain until the bridge hangs up.
        let drain = async { while out_rx.recv().await.is_some() {} };
        timeout(Duration::from_secs(5), drain).await.unwrap();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_spawn_missing_shell_fails() {
        let result = PtyBridge::spawn("/nonexistent/shell", 80, 24);
        assert!(matches!(result, Err(SessionError::PtyFailed(_))));
    }
}
