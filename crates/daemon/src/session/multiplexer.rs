//! Stream multiplexer.
//!
//! Drives one spawned process from `start` to its terminal event. Standard
//! output and standard error are read line by line on their own tasks, a
//! third task waits for the process, and a single coordinating loop
//! serializes everything onto whichever response stream is currently bound
//! to the session.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use protocol::StreamEvent;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::input::InputHandle;
use super::process::ProcessRegistry;
use super::registry::{EventSink, SessionRegistry};
use super::spawner::describe_exit;

/// Lines queued per output pipe before its reader waits.
const LINE_QUEUE_CAPACITY: usize = 1;

/// Everything the coordinating loop needs to know about one process.
#[derive(Debug)]
pub struct StreamContext {
    pub terminal_id: String,
    pub instance: Uuid,
    pub pid: u32,
    pub cancel: CancellationToken,
    pub binding: watch::Receiver<EventSink>,
    pub input: InputHandle,
}

/// How a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The process exited on its own.
    Exited { exit_code: i32, error: String },
    /// The stream was cancelled and the process killed.
    Cancelled,
}

/// Fans process output into [`StreamEvent`]s and cleans up afterwards.
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    processes: Arc<ProcessRegistry>,
    sessions: Arc<SessionRegistry>,
    exit_drain: Duration,
}

impl StreamMultiplexer {
    pub fn new(
        processes: Arc<ProcessRegistry>,
        sessions: Arc<SessionRegistry>,
        exit_drain: Duration,
    ) -> Self {
        Self {
            processes,
            sessions,
            exit_drain,
        }
    }

    /// Run a process to completion or cancellation.
    ///
    /// Both registries lose their entries for this process before the
    /// terminal event is delivered, on every exit path.
    pub async fn run<O, E>(
        &self,
        child: Child,
        stdout: O,
        stderr: E,
        ctx: StreamContext,
    ) -> StreamOutcome
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let StreamContext {
            terminal_id,
            instance,
            pid,
            cancel,
            binding,
            input,
        } = ctx;

        let mut pump = Pump::new(binding);

        let (stdout_tx, mut stdout_rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let (stderr_tx, mut stderr_rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        let stdout_task = tokio::spawn(read_lines(stdout, stdout_tx));
        let stderr_task = tokio::spawn(read_lines(stderr, stderr_tx));
        let mut waiter = tokio::spawn(wait_or_kill(child, cancel.clone()));

        if !pump.emit(StreamEvent::Start { pid }).await {
            cancel.cancel();
        }

        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut binding_live = true;

        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break None,

                changed = pump.binding.changed(), if binding_live => {
                    match changed {
                        Ok(()) => pump.adopt(),
                        Err(_) => binding_live = false,
                    }
                }

                line = stdout_rx.recv(), if stdout_open => match line {
                    Some(data) => {
                        if !pump.emit(StreamEvent::Stdout { data }).await {
                            cancel.cancel();
                        }
                    }
                    None => stdout_open = false,
                },

                line = stderr_rx.recv(), if stderr_open => match line {
                    Some(data) => {
                        if !pump.emit(StreamEvent::Stderr { data }).await {
                            cancel.cancel();
                        }
                    }
                    None => stderr_open = false,
                },

                status = &mut waiter => break Some(status),

                _ = pump.sink.closed() => {
                    if !pump.refresh() {
                        tracing::debug!(
                            terminal_id = %terminal_id,
                            pid = pid,
                            "Response stream closed by client"
                        );
                        cancel.cancel();
                    }
                }
            }
        };

        let outcome = match exit {
            Some(status) => {
                let deadline = tokio::time::sleep(self.exit_drain);
                tokio::pin!(deadline);

                while stdout_open || stderr_open {
                    tokio::select! {
                        biased;

                        _ = &mut deadline => break,

                        line = stdout_rx.recv(), if stdout_open => match line {
                            Some(data) => {
                                if !pump.emit(StreamEvent::Stdout { data }).await {
                                    break;
                                }
                            }
                            None => stdout_open = false,
                        },

                        line = stderr_rx.recv(), if stderr_open => match line {
                            Some(data) => {
                                if !pump.emit(StreamEvent::Stderr { data }).await {
                                    break;
                                }
                            }
                            None => stderr_open = false,
                        },
                    }
                }

                let (exit_code, error) = exit_result(status);
                tracing::info!(
                    terminal_id = %terminal_id,
                    pid = pid,
                    exit_code = exit_code,
                    "Process exited"
                );
                StreamOutcome::Exited { exit_code, error }
            }
            None => {
                // The waiter kills the child on cancellation; wait for the reap.
                if let Err(e) = waiter.await {
                    tracing::warn!(pid = pid, error = %e, "Process waiter failed");
                }
                tracing::info!(terminal_id = %terminal_id, pid = pid, "Command cancelled");
                StreamOutcome::Cancelled
            }
        };

        input.close().await;
        self.processes.remove(pid).await;
        self.sessions.remove_instance(&terminal_id, instance);
        stdout_task.abort();
        stderr_task.abort();

        let last = match &outcome {
            StreamOutcome::Exited { exit_code, error } => StreamEvent::End {
                exit_code: *exit_code,
                error: error.clone(),
            },
            StreamOutcome::Cancelled => StreamEvent::cancelled(),
        };
        pump.emit(last).await;

        outcome
    }
}

/// The currently bound response stream, followed through rebinds.
struct Pump {
    sink: EventSink,
    binding: watch::Receiver<EventSink>,
}

impl Pump {
    fn new(mut binding: watch::Receiver<EventSink>) -> Self {
        let sink = binding.borrow_and_update().clone();
        Self { sink, binding }
    }

    /// Take the latest bound stream, releasing the previous one.
    fn adopt(&mut self) {
        self.sink = self.binding.borrow_and_update().clone();
    }

    /// Adopt a newer binding if there is one.
    fn refresh(&mut self) -> bool {
        match self.binding.has_changed() {
            Ok(true) => {
                self.adopt();
                true
            }
            _ => false,
        }
    }

    /// Deliver an event. Returns `false` if no client is listening.
    async fn emit(&mut self, mut event: StreamEvent) -> bool {
        self.refresh();
        loop {
            match self.sink.send(event).await {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    if !self.refresh() {
                        return false;
                    }
                    event = returned;
                }
            }
        }
    }
}

/// Wait for the child, killing it first if `cancel` fires.
async fn wait_or_kill(mut child: Child, cancel: CancellationToken) -> io::Result<ExitStatus> {
    tokio::select! {
        status = child.wait() => status,
        _ = cancel.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "Kill failed; process already gone");
            }
            child.wait().await
        }
    }
}

fn exit_result(status: Result<io::Result<ExitStatus>, tokio::task::JoinError>) -> (i32, String) {
    match status {
        Ok(Ok(status)) => describe_exit(&status),
        Ok(Err(e)) => (-1, e.to_string()),
        Err(e) => (-1, e.to_string()),
    }
}

/// Read `\n`-terminated lines until end of stream.
///
/// A trailing `\r` is stripped and invalid UTF-8 is replaced. The last
/// line is delivered even without a terminator.
async fn read_lines<R>(reader: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if lines.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Output pipe read failed");
                break;
            }
        }
    }
}
