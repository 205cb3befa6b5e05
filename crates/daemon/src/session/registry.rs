//! Registry of terminal sessions keyed by client-chosen terminal id.
//!
//! A terminal id maps to at most one live process. Commands for an id that
//! is already running are written to that process's input instead of
//! spawning a second one. Submissions for one id take its claim first, so
//! only one of them can ever reach the spawn step.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{StreamEvent, Terminal};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::input::InputHandle;

/// Sending half of a client's event stream.
pub type EventSink = mpsc::Sender<StreamEvent>;

/// One terminal tab with a running process.
///
/// Clones share the input pipe, cancellation token and stream binding.
#[derive(Debug, Clone)]
pub struct TerminalSession {
    /// Client-facing id and display name.
    pub terminal: Terminal,
    /// Distinguishes this process instance from later ones under the same id.
    pub instance: Uuid,
    /// Pid of the running process.
    pub pid: u32,
    /// Standard input of the running process.
    pub input: InputHandle,
    /// Cancels the stream driving this session.
    pub cancel: CancellationToken,
    binding: Arc<watch::Sender<EventSink>>,
}

impl TerminalSession {
    /// Describe a freshly spawned process bound to `sink`.
    pub fn new(
        terminal: Terminal,
        pid: u32,
        input: InputHandle,
        cancel: CancellationToken,
        sink: EventSink,
    ) -> Self {
        let (binding, _) = watch::channel(sink);
        Self {
            terminal,
            instance: Uuid::new_v4(),
            pid,
            input,
            cancel,
            binding: Arc::new(binding),
        }
    }

    /// Terminal id of this session.
    pub fn id(&self) -> &str {
        &self.terminal.terminal_id
    }

    /// Attach a new response stream. The previously bound stream is released.
    pub fn rebind(&self, sink: EventSink) {
        drop(self.binding.send_replace(sink));
    }

    /// Follow the currently bound response stream.
    pub fn subscribe_binding(&self) -> watch::Receiver<EventSink> {
        self.binding.subscribe()
    }
}

/// Outcome of looking a terminal id up.
#[derive(Debug)]
pub enum Attach {
    /// A process is running for this id.
    Hit(TerminalSession),
    /// Nothing is running; the caller should spawn.
    Miss,
}

/// Exclusive right to start a process for one terminal id.
///
/// Released on drop; the per-id lock is forgotten once nobody waits on it.
pub struct TerminalClaim<'a> {
    registry: &'a SessionRegistry,
    terminal_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TerminalClaim<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.registry
            .claims
            .remove_if(&self.terminal_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Concurrency-safe map from terminal id to [`TerminalSession`].
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, TerminalSession>,
    claims: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `terminal_id`.
    ///
    /// Hold the claim from lookup until the new session is inserted.
    pub async fn claim(&self, terminal_id: &str) -> TerminalClaim<'_> {
        let lock = Arc::clone(
            self.claims
                .entry(terminal_id.to_string())
                .or_default()
                .value(),
        );
        let guard = lock.lock_owned().await;
        TerminalClaim {
            registry: self,
            terminal_id: terminal_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Look up the live session for a terminal id.
    pub fn attach(&self, terminal_id: &str) -> Attach {
        match self.sessions.get(terminal_id) {
            Some(entry) => Attach::Hit(entry.value().clone()),
            None => Attach::Miss,
        }
    }

    /// Insert a session if its terminal id is free.
    ///
    /// When another request got there first, the existing session is
    /// returned and `session` is discarded.
    pub fn insert(&self, session: TerminalSession) -> Result<(), TerminalSession> {
        match self.sessions.entry(session.id().to_string()) {
            Entry::Occupied(entry) => Err(entry.get().clone()),
            Entry::Vacant(entry) => {
                tracing::debug!(
                    terminal_id = %session.terminal.terminal_id,
                    pid = session.pid,
                    instance = %session.instance,
                    "Registered terminal session"
                );
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Tear a session down: remove it, close its input and cancel its stream.
    pub async fn terminate(&self, terminal_id: &str) -> Option<TerminalSession> {
        let (_, session) = self.sessions.remove(terminal_id)?;
        Self::shut(&session).await;
        Some(session)
    }

    /// Like [`SessionRegistry::terminate`], but only if `instance` is still
    /// the registered one.
    pub async fn terminate_instance(
        &self,
        terminal_id: &str,
        instance: Uuid,
    ) -> Option<TerminalSession> {
        let (_, session) = self
            .sessions
            .remove_if(terminal_id, |_, s| s.instance == instance)?;
        Self::shut(&session).await;
        Some(session)
    }

    /// Remove the entry for `terminal_id` if it still belongs to `instance`.
    pub fn remove_instance(&self, terminal_id: &str, instance: Uuid) -> bool {
        self.sessions
            .remove_if(terminal_id, |_, s| s.instance == instance)
            .is_some()
    }

    /// Terminate every session.
    pub async fn terminate_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut count = 0;
        for id in ids {
            if self.terminate(&id).await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Snapshot of all live terminals.
    ///
    /// When nothing is running a single default terminal is reported so a
    /// client always has something to attach to.
    pub fn list(&self) -> Vec<Terminal> {
        let mut terminals: Vec<Terminal> = self
            .sessions
            .iter()
            .map(|entry| entry.value().terminal.clone())
            .collect();

        if terminals.is_empty() {
            terminals.push(Terminal::default_terminal());
        } else {
            terminals.sort_by(|a, b| a.terminal_id.cmp(&b.terminal_id));
        }
        terminals
    }

    /// Whether a terminal id has a live session.
    pub fn contains(&self, terminal_id: &str) -> bool {
        self.sessions.contains_key(terminal_id)
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    async fn shut(session: &TerminalSession) {
        // Cancel first so the process is killed even if a write holds the input.
        session.cancel.cancel();
        session.input.close().await;
        tracing::info!(
            terminal_id = %session.terminal.terminal_id,
            pid = session.pid,
            "Terminated terminal session"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::DEFAULT_TERMINAL_ID;

    fn session(id: &str, pid: u32) -> (TerminalSession, mpsc::Receiver<StreamEvent>) {
        let (client, _server) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(8);
        let session = TerminalSession::new(
            Terminal::new(id, format!("Tab {id}")),
            pid,
            InputHandle::new(client),
            CancellationToken::new(),
            tx,
        );
        (session, rx)
    }

    #[test]
    fn test_attach_miss_then_hit() {
        let registry = SessionRegistry::new();
        assert!(matches!(registry.attach("t1"), Attach::Miss));

        let (s, _rx) = session("t1", 10);
        registry.insert(s).unwrap();

        match registry.attach("t1") {
            Attach::Hit(found) => assert_eq!(found.pid, 10),
            Attach::Miss => panic!("expected a hit"),
        }
        assert!(registry.contains("t1"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_insert_conflict_returns_existing() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = session("t1", 10);
        let (second, _rx2) = session("t1", 20);
        let first_instance = first.instance;

        registry.insert(first).unwrap();
        let existing = registry.insert(second).unwrap_err();

        assert_eq!(existing.pid, 10);
        assert_eq!(existing.instance, first_instance);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_list_reports_default_when_empty() {
        let registry = SessionRegistry::new();
        let terminals = registry.list();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].terminal_id, DEFAULT_TERMINAL_ID);
    }

    #[test]
    fn test_list_live_sessions() {
        let registry = SessionRegistry::new();
        let (b, _rb) = session("b", 2);
        let (a, _ra) = session("a", 1);
        registry.insert(b).unwrap();
        registry.insert(a).unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|t| t.terminal_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_terminate_closes_input_and_cancels() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session("t1", 10);
        let cancel = s.cancel.clone();
        let input = s.input.clone();
        registry.insert(s).unwrap();

        let removed = registry.terminate("t1").await;
        assert!(removed.is_some());
        assert!(cancel.is_cancelled());
        assert!(input.is_closed());
        assert!(!registry.contains("t1"));

        assert!(registry.terminate("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_terminate_with_blocked_input_write() {
        let registry = SessionRegistry::new();
        // Keep the reader alive but never drain it.
        let (client, _server) = tokio::io::duplex(16);
        let (tx, _rx) = mpsc::channel(8);
        let s = TerminalSession::new(
            Terminal::new("t1", "Tab t1"),
            10,
            InputHandle::new(client),
            CancellationToken::new(),
            tx,
        );
        let cancel = s.cancel.clone();
        let input = s.input.clone();
        registry.insert(s).unwrap();

        let blocked = tokio::spawn(async move { input.write(&vec![b'x'; 64 * 1024]).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let removed =
            tokio::time::timeout(std::time::Duration::from_secs(2), registry.terminate("t1"))
                .await
                .unwrap();
        assert!(removed.is_some());
        assert!(cancel.is_cancelled());
        assert!(blocked.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_claim_serializes_per_terminal() {
        let registry = Arc::new(SessionRegistry::new());
        let claim = registry.claim("t1").await;

        // A different id is independent.
        drop(registry.claim("t2").await);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _claim = registry.claim("t1").await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(claim);
        tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.claims.is_empty());
    }

    #[test]
    fn test_remove_instance_ignores_newer_session() {
        let registry = SessionRegistry::new();
        let (old, _r1) = session("t1", 10);
        let old_instance = old.instance;
        registry.insert(old).unwrap();
        assert!(registry.remove_instance("t1", old_instance));

        let (new, _r2) = session("t1", 11);
        registry.insert(new).unwrap();

        assert!(!registry.remove_instance("t1", old_instance));
        assert!(registry.contains("t1"));
    }

    #[tokio::test]
    async fn test_terminate_instance_requires_match() {
        let registry = SessionRegistry::new();
        let (s, _rx) = session("t1", 10);
        let instance = s.instance;
        registry.insert(s).unwrap();

        assert!(registry.terminate_instance("t1", Uuid::new_v4()).await.is_none());
        assert!(registry.contains("t1"));
        assert!(registry.terminate_instance("t1", instance).await.is_some());
        assert!(!registry.contains("t1"));
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let registry = SessionRegistry::new();
        let (a, _ra) = session("a", 1);
        let (b, _rb) = session("b", 2);
        registry.insert(a).unwrap();
        registry.insert(b).unwrap();

        assert_eq!(registry.terminate_all().await, 2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_rebind_releases_previous_stream() {
        let (s, mut old_rx) = session("t1", 10);
        let binding = s.subscribe_binding();
        let (new_tx, mut new_rx) = mpsc::channel(8);

        s.rebind(new_tx);

        // Only the watch slot held the old sender.
        assert!(old_rx.recv().await.is_none());

        let current = binding.borrow().clone();
        current
            .send(StreamEvent::Stdout { data: "x".into() })
            .await
            .unwrap();
        assert_eq!(
            new_rx.recv().await,
            Some(StreamEvent::Stdout { data: "x".into() })
        );
    }
}
