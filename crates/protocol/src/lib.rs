//! # Termexec Protocol Library
//!
//! Wire definitions shared by the Termexec daemon and its clients.
//!
//! ## Overview
//!
//! - **Message Definitions**: request and response bodies for one-shot
//!   execution, streaming execution, input injection and session listing
//! - **Stream Events**: the `start` / `stdout` / `stderr` / `end` / `error`
//!   events emitted while a command runs
//! - **Frame Codec**: `data: <json>` event-stream framing with an
//!   incremental decoder for clients
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{encode_event, FrameDecoder, StreamEvent};
//!
//! let wire = encode_event(&StreamEvent::Start { pid: 4242 }).unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! let events = decoder.push(wire.as_bytes()).unwrap();
//! assert_eq!(events, vec![StreamEvent::Start { pid: 4242 }]);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Request, response and event definitions
//! - [`framing`]: Event-stream frame codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{decode_frame, encode_event, event_payload, FrameDecoder, MAX_FRAME_SIZE};
pub use messages::{
    ExecRequest, ExecResponse, ExtensionStatus, InputAck, InputRequest, StreamEvent, Terminal,
    TerminateRequest, CANCELLED_MESSAGE, DEFAULT_TERMINAL_ID, DEFAULT_TERMINAL_NAME,
};
