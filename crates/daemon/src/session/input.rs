//! Shared handle to a child process's standard input.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::error::SessionError;

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Buffered, closable writer shared by the process and session registries.
///
/// Clones refer to the same pipe. The lock is held only for one
/// write-and-flush pair, never across unrelated awaits. Closing interrupts
/// a write that is stuck on a full pipe.
#[derive(Clone)]
pub struct InputHandle {
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    closed: CancellationToken,
}

impl InputHandle {
    /// Wrap a writable stream.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Self {
            writer: Arc::new(Mutex::new(Some(BufWriter::new(boxed)))),
            closed: CancellationToken::new(),
        }
    }

    /// Write all bytes and flush them to the pipe.
    ///
    /// Fails as soon as the handle is closed, even mid-write.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.closed.cancelled() => return Err(closed_error()),
        };
        let writer = guard.as_mut().ok_or_else(closed_error)?;

        tokio::select! {
            result = write_and_flush(writer, data) => {
                result.map_err(|e| SessionError::WriteFailed(e.to_string()))
            }
            _ = self.closed.cancelled() => Err(closed_error()),
        }
    }

    /// Close the pipe. The child sees end-of-file; later writes fail.
    pub async fn close(&self) {
        self.closed.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            // The child may already be gone; a failed shutdown changes nothing.
            let _ = writer.shutdown().await;
        }
    }

    /// Whether [`InputHandle::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

async fn write_and_flush(writer: &mut BoxedWriter, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

fn closed_error() -> SessionError {
    SessionError::WriteFailed("input stream closed".to_string())
}

impl fmt::Debug for InputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputHandle").finish_non_exhaustive()
    }
}
