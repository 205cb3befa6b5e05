//! Terminal session engine.
//!
//! This module spawns shell processes, tracks them by pid and by terminal
//! id, multiplexes their output into stream events, and bridges raw PTY
//! shells.

pub mod error;
pub mod input;
pub mod multiplexer;
pub mod process;
pub mod pty;
pub mod registry;
pub mod spawner;

pub use error::{SessionError, SpawnError};
pub use input::InputHandle;
pub use multiplexer::{StreamContext, StreamMultiplexer, StreamOutcome};
pub use process::{ManagedProcess, ProcessRegistry};
pub use pty::{PtyBridge, PTY_CHUNK_SIZE};
pub use registry::{Attach, EventSink, SessionRegistry, TerminalClaim, TerminalSession};
pub use spawner::{describe_exit, ProcessSpawner, SpawnedProcess};
