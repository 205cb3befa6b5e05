//! Exec service wiring the session engine together.
//!
//! `ExecService` owns the spawner, both registries and the multiplexer. One
//! instance is built per server at startup and shared by every handler;
//! tests build their own isolated instances.

use std::process::Stdio;
use std::sync::Arc;

use protocol::{ExecRequest, ExecResponse, StreamEvent, Terminal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ExecConfig;
use crate::session::{
    describe_exit, Attach, EventSink, InputHandle, ManagedProcess, ProcessRegistry,
    ProcessSpawner, SessionError, SessionRegistry, SpawnedProcess, StreamContext,
    StreamMultiplexer, TerminalSession,
};

/// Events buffered per response stream before the multiplexer waits.
const STREAM_BUFFER: usize = 64;

/// Command execution over one-shot and session-backed streaming paths.
#[derive(Debug)]
pub struct ExecService {
    config: ExecConfig,
    spawner: ProcessSpawner,
    processes: Arc<ProcessRegistry>,
    sessions: Arc<SessionRegistry>,
    multiplexer: StreamMultiplexer,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ExecService {
    /// Creates a service with empty registries.
    pub fn new(config: ExecConfig) -> Self {
        let processes = Arc::new(ProcessRegistry::new());
        let sessions = Arc::new(SessionRegistry::new());
        let multiplexer = StreamMultiplexer::new(
            Arc::clone(&processes),
            Arc::clone(&sessions),
            config.exit_drain(),
        );

        Self {
            spawner: ProcessSpawner::from_config(&config),
            config,
            processes,
            sessions,
            multiplexer,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run a command in a new process and collect its output.
    ///
    /// Standard input is empty. The process is killed when the one-shot
    /// deadline passes; the response then reports exit code `-1`.
    pub async fn exec_once(&self, cmd: &str) -> ExecResponse {
        let deadline = self.config.oneshot_timeout();
        let mut command = self.spawner.command(cmd);
        command.stdin(Stdio::null());

        match tokio::time::timeout(deadline, command.output()).await {
            Ok(Ok(output)) => {
                let (exit_code, error) = describe_exit(&output.status);
                debug!(exit_code = exit_code, "One-shot command finished");
                ExecResponse {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code,
                    error,
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to run one-shot command");
                ExecResponse {
                    exit_code: -1,
                    error: format!("failed to start command: {e}"),
                    ..ExecResponse::default()
                }
            }
            Err(_) => {
                warn!(cmd = %cmd, "One-shot command timed out");
                ExecResponse {
                    exit_code: -1,
                    error: format!("command timed out after {}s", deadline.as_secs()),
                    ..ExecResponse::default()
                }
            }
        }
    }

    /// Submit a command to a terminal session and stream its events.
    ///
    /// If the terminal already has a running process the command is typed
    /// into it and the returned stream carries that process's remaining
    /// output. Otherwise a new process is spawned and the stream starts with
    /// its `start` event.
    pub async fn exec_stream(
        &self,
        request: &ExecRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, SessionError> {
        let terminal_id = request.terminal_id();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        // Concurrent submissions for this id queue here; the first spawns and
        // the rest find its session on lookup.
        let _claim = self.sessions.claim(terminal_id).await;

        if let Attach::Hit(session) = self.sessions.attach(terminal_id) {
            if self.redirect(&session, &request.cmd, &tx).await {
                return Ok(rx);
            }
        }

        if request.cmd.is_empty() {
            debug!(terminal_id = %terminal_id, "Empty command; nothing to run");
            return Ok(rx);
        }

        let SpawnedProcess {
            pid,
            child,
            stdin,
            stdout,
            stderr,
        } = self.spawner.spawn(&request.cmd)?;

        let input = InputHandle::new(stdin);
        let session = TerminalSession::new(
            Terminal::new(terminal_id, request.terminal_name()),
            pid,
            input.clone(),
            self.shutdown.child_token(),
            tx.clone(),
        );

        // Only claim holders insert, so an occupant here was never attached.
        while let Err(existing) = self.sessions.insert(session.clone()) {
            warn!(
                terminal_id = %terminal_id,
                pid = existing.pid,
                "Replacing session registered outside its claim"
            );
            self.sessions
                .terminate_instance(terminal_id, existing.instance)
                .await;
        }

        self.processes
            .register(ManagedProcess::new(
                pid,
                terminal_id,
                request.cmd.as_str(),
                input.clone(),
            ))
            .await;

        let ctx = StreamContext {
            terminal_id: terminal_id.to_string(),
            instance: session.instance,
            pid,
            cancel: session.cancel.clone(),
            binding: session.subscribe_binding(),
            input,
        };

        let multiplexer = self.multiplexer.clone();
        self.tasks.spawn(async move {
            multiplexer.run(child, stdout, stderr, ctx).await;
        });

        info!(terminal_id = %terminal_id, pid = pid, cmd = %request.cmd, "Spawned terminal process");
        Ok(rx)
    }

    /// Write raw input to a tracked process.
    pub async fn inject_input(&self, pid: u32, input: &[u8]) -> Result<(), SessionError> {
        self.processes.inject_input(pid, input).await
    }

    /// Tear down a terminal session. Returns whether one was running.
    pub async fn terminate(&self, terminal_id: &str) -> bool {
        self.sessions.terminate(terminal_id).await.is_some()
    }

    /// Live terminals, or the default terminal when none are running.
    pub fn list_terminals(&self, ws_port: u16) -> Vec<Terminal> {
        self.sessions
            .list()
            .into_iter()
            .map(|terminal| terminal.with_host(ws_port, std::env::consts::OS))
            .collect()
    }

    /// Cancel every stream and wait for their processes to be reaped.
    pub async fn shutdown(&self) {
        info!(sessions = self.sessions.count(), "Shutting down exec service");
        for process in self.processes.list().await {
            debug!(
                pid = process.pid,
                terminal_id = %process.terminal_id,
                cmd = %process.command,
                "Stopping process"
            );
        }
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Token cancelled when the service shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Type `cmd` into a running session and bind its output to `sink`.
    ///
    /// A failed write means the process is gone; the stale session is torn
    /// down and `false` is returned so the caller spawns afresh.
    async fn redirect(&self, session: &TerminalSession, cmd: &str, sink: &EventSink) -> bool {
        let mut line = Vec::with_capacity(cmd.len() + 1);
        line.extend_from_slice(cmd.as_bytes());
        line.push(b'\n');

        match session.input.write(&line).await {
            Ok(()) => {
                session.rebind(sink.clone());
                info!(
                    terminal_id = %session.id(),
                    pid = session.pid,
                    "Redirected command to running session"
                );
                true
            }
            Err(e) => {
                warn!(
                    terminal_id = %session.id(),
                    pid = session.pid,
                    error = %e,
                    "Discarding stale session"
                );
                self.sessions
                    .terminate_instance(session.id(), session.instance)
                    .await;
                false
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn service() -> ExecService {
        ExecService::new(ExecConfig::default())
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn wait_until_gone(service: &ExecService, terminal_id: &str) {
        for _ in 0..100 {
            if !service.sessions().contains(terminal_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session {terminal_id} never went away");
    }

    #[tokio::test]
    async fn test_exec_once_echo() {
        let response = service().exec_once("echo hello").await;
        assert_eq!(response.stdout, "hello\n");
        assert_eq!(response.stderr, "");
        assert_eq!(response.exit_code, 0);
        assert!(response.error.is_empty());
    }

    #[tokio::test]
    async fn test_exec_once_exit_code() {
        let response = service().exec_once("echo bad >&2; exit 3").await;
        assert_eq!(response.exit_code, 3);
        assert_eq!(response.stderr, "bad\n");
    }

    #[tokio::test]
    async fn test_exec_once_ignores_sessions() {
        let service = service();
        service.exec_once("true").await;
        assert_eq!(service.sessions().count(), 0);
        assert_eq!(service.processes().count().await, 0);
    }

    #[tokio::test]
    async fn test_exec_once_timeout() {
        let config = ExecConfig {
            oneshot_timeout_secs: 1,
            ..ExecConfig::default()
        };
        let response = ExecService::new(config).exec_once("sleep 10").await;
        assert_eq!(response.exit_code, -1);
        assert!(response.error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_stream_spawns_and_cleans_up() {
        let service = service();
        let rx = service
            .exec_stream(&ExecRequest::for_terminal("echo hi", "t1"))
            .await
            .unwrap();

        let events = collect(rx).await;
        assert!(matches!(events.first(), Some(StreamEvent::Start { .. })));
        assert!(events.contains(&StreamEvent::Stdout { data: "hi".into() }));
        assert_eq!(
            events.last(),
            Some(&StreamEvent::End {
                exit_code: 0,
                error: String::new()
            })
        );

        assert!(!service.sessions().contains("t1"));
        assert_eq!(service.processes().count().await, 0);
    }

    #[tokio::test]
    async fn test_stream_empty_command_on_miss() {
        let service = service();
        let rx = service
            .exec_stream(&ExecRequest::for_terminal("", "t1"))
            .await
            .unwrap();
        assert!(collect(rx).await.is_empty());
        assert_eq!(service.sessions().count(), 0);
    }

    #[tokio::test]
    async fn test_hit_writes_to_existing_process() {
        let service = service();
        let mut first = service
            .exec_stream(&ExecRequest::for_terminal("cat", "t1"))
            .await
            .unwrap();
        let pid = match first.recv().await {
            Some(StreamEvent::Start { pid }) => pid,
            other => panic!("expected start, got {other:?}"),
        };

        let mut second = service
            .exec_stream(&ExecRequest::for_terminal("hello cat", "t1"))
            .await
            .unwrap();

        // The first stream is released without a terminal event.
        assert_eq!(first.recv().await, None);
        assert_eq!(
            timeout(Duration::from_secs(5), second.recv()).await.unwrap(),
            Some(StreamEvent::Stdout {
                data: "hello cat".into()
            })
        );
        assert_eq!(service.processes().count().await, 1);
        assert!(service.processes().contains(pid).await);

        assert!(service.terminate("t1").await);
        assert_eq!(second.recv().await, Some(StreamEvent::cancelled()));
        assert_eq!(second.recv().await, None);
        assert_eq!(service.processes().count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_session_falls_through_to_spawn() {
        let service = service();
        // The shell closes its stdin, so typing into it fails.
        let mut first = service
            .exec_stream(&ExecRequest::for_terminal("exec 0<&-; sleep 30", "t1"))
            .await
            .unwrap();
        assert!(matches!(first.recv().await, Some(StreamEvent::Start { .. })));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(matches!(service.sessions().attach("t1"), Attach::Hit(_)));

        let rx = service
            .exec_stream(&ExecRequest::for_terminal("echo fresh", "t1"))
            .await
            .unwrap();
        let events = collect(rx).await;
        assert!(matches!(events.first(), Some(StreamEvent::Start { .. })));
        assert!(events.contains(&StreamEvent::Stdout {
            data: "fresh".into()
        }));
        assert_eq!(first.recv().await, Some(StreamEvent::cancelled()));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("runs");
        let cmd = format!("echo x >> '{}'; cat", marker.display());

        let service = Arc::new(service());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&service);
            let cmd = cmd.clone();
            handles.push(tokio::spawn(async move {
                service
                    .exec_stream(&ExecRequest::for_terminal(cmd, "race"))
                    .await
                    .unwrap()
            }));
        }

        let mut streams = Vec::new();
        for handle in handles {
            streams.push(handle.await.unwrap());
        }

        assert_eq!(service.sessions().count(), 1);
        assert_eq!(service.processes().count().await, 1);

        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        service.terminate("race").await;
        let mut starts = 0;
        for rx in streams {
            let events = timeout(Duration::from_secs(5), collect(rx)).await.unwrap();
            starts += events
                .iter()
                .filter(|e| matches!(e, StreamEvent::Start { .. }))
                .count();
        }
        assert_eq!(starts, 1);
        wait_until_gone(&service, "race").await;

        // The command line ran in exactly one shell.
        let runs = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_while_input_is_blocked() {
        let service = Arc::new(service());
        let mut rx = service
            .exec_stream(&ExecRequest::for_terminal("sleep 30", "t1"))
            .await
            .unwrap();
        let pid = match rx.recv().await {
            Some(StreamEvent::Start { pid }) => pid,
            other => panic!("expected start, got {other:?}"),
        };

        // sleep never reads stdin, so this fills the pipe and stalls.
        let injector = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.inject_input(pid, &vec![b'x'; 1 << 20]).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;

        let terminated = timeout(Duration::from_secs(3), service.terminate("t1"))
            .await
            .unwrap();
        assert!(terminated);
        assert!(timeout(Duration::from_secs(3), injector)
            .await
            .unwrap()
            .unwrap()
            .is_err());

        let events = timeout(Duration::from_secs(5), collect(rx)).await.unwrap();
        assert_eq!(events.last(), Some(&StreamEvent::cancelled()));
        assert_eq!(service.processes().count().await, 0);
    }

    #[tokio::test]
    async fn test_inject_input() {
        let service = service();
        let mut rx = service
            .exec_stream(&ExecRequest::for_terminal("read x; echo \"x=$x\"", "t1"))
            .await
            .unwrap();
        let pid = match rx.recv().await {
            Some(StreamEvent::Start { pid }) => pid,
            other => panic!("expected start, got {other:?}"),
        };

        service.inject_input(pid, b"42\n").await.unwrap();
        let events = collect(rx).await;
        assert!(events.contains(&StreamEvent::Stdout { data: "x=42".into() }));

        let missing = service.inject_input(pid, b"late\n").await;
        assert!(matches!(missing, Err(SessionError::NotFound(p)) if p == pid));
    }

    #[tokio::test]
    async fn test_list_terminals() {
        let service = service();
        let listed = service.list_terminals(8080);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].terminal_id, protocol::DEFAULT_TERMINAL_ID);
        assert_eq!(listed[0].ws_port, 8080);
        assert_eq!(listed[0].mode, std::env::consts::OS);

        let mut rx = service
            .exec_stream(&ExecRequest {
                cmd: "cat".into(),
                terminal_id: "build".into(),
                terminal_name: "Build".into(),
            })
            .await
            .unwrap();
        rx.recv().await;

        let listed = service.list_terminals(8080);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].terminal_id, "build");
        assert_eq!(listed[0].terminal_name, "Build");

        service.terminate("build").await;
        wait_until_gone(&service, "build").await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_streams() {
        let service = service();
        let rx = service
            .exec_stream(&ExecRequest::for_terminal("sleep 30", "t1"))
            .await
            .unwrap();

        timeout(Duration::from_secs(5), service.shutdown())
            .await
            .unwrap();

        let events = collect(rx).await;
        assert_eq!(events.last(), Some(&StreamEvent::cancelled()));
        assert_eq!(service.sessions().count(), 0);
        assert_eq!(service.processes().count().await, 0);
    }
}
