//! Event-stream framing for [`StreamEvent`]s.
//!
//! # Frame Format
//!
//! Each event travels as one server-sent-events frame:
//! - `data: ` prefix
//! - the event as single-line JSON
//! - a blank line (`\n\n`) terminating the frame
//!
//! Lines starting with `:` are comments (keep-alives) and carry no event.
//! Decoders accept `\r\n` line endings as well.

use crate::error::{ProtocolError, Result};
use crate::messages::StreamEvent;

/// Prefix of a data line.
pub const DATA_PREFIX: &str = "data:";

/// Terminator separating two frames.
pub const FRAME_TERMINATOR: &str = "\n\n";

/// Maximum size of a single buffered frame (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Serialize an event to the JSON payload carried by a data line.
///
/// serde_json never emits raw newlines, so the payload always fits on one
/// data line.
pub fn event_payload(event: &StreamEvent) -> Result<String> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Encode an event into a complete frame.
pub fn encode_event(event: &StreamEvent) -> Result<String> {
    let payload = event_payload(event)?;
    Ok(format!("{} {}{}", DATA_PREFIX, payload, FRAME_TERMINATOR))
}

/// Decode the text of one frame (without its terminating blank line).
///
/// Returns `None` for frames that only contain comments or unknown fields.
pub fn decode_frame(frame: &str) -> Result<Option<StreamEvent>> {
    let mut data: Option<String> = None;

    for line in frame.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix(DATA_PREFIX) {
            let value = value.strip_prefix(' ').unwrap_or(value);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
                None => data = Some(value.to_string()),
            }
        } else if !line.contains(':') {
            return Err(ProtocolError::MalformedFrame(format!(
                "unexpected line in frame: {line}"
            )));
        }
        // Other fields (event:, id:, retry:) are ignored.
    }

    match data {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Incremental decoder for a byte stream of frames.
///
/// Bytes can be pushed in arbitrary chunks; complete events are returned as
/// soon as their terminating blank line arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    pending: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    /// Feed bytes into the decoder and return every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<StreamEvent>> {
        self.pending.extend_from_slice(bytes);

        // Keep an incomplete UTF-8 sequence for the next push.
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => {
                return Err(ProtocolError::MalformedFrame(format!(
                    "invalid UTF-8 in stream: {e}"
                )))
            }
        };
        let rest = self.pending.split_off(valid);
        let text = std::mem::replace(&mut self.pending, rest);
        // Only valid UTF-8 up to `valid` was kept above.
        self.buffer.push_str(&String::from_utf8_lossy(&text));

        if self.buffered() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.buffered(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_frame_end(&self.buffer) {
            let frame: String = self.buffer.drain(..end + sep_len).collect();
            if let Some(event) = decode_frame(&frame[..end])? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

/// Locate the first blank line, returning its offset and separator length.
fn find_frame_end(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
