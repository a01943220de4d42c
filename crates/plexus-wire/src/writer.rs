//! Locked message writer.
//!
//! Each writer owns its own lock, held across the whole header+payload
//! write, so concurrent senders to the same stream can never interleave
//! frames. Cloning the handle shares the underlying stream and lock.

use crate::codec;
use crate::error::WireError;
use crate::message::Message;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable handle to an exclusively-written message stream.
///
/// # Atomicity
///
/// [`send`](Self::send) serializes the message first and only then
/// takes the stream lock for the write, keeping the critical section
/// to pure I/O.
///
/// # Closing
///
/// [`close`](Self::close) shuts the stream down and is idempotent;
/// subsequent sends fail with [`WireError::Closed`].
#[derive(Clone)]
pub struct MessageWriter {
    stream: Arc<Mutex<Option<BoxedWriter>>>,
}

impl MessageWriter {
    /// Wraps a stream in a locked writer handle.
    #[must_use]
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(Box::new(writer)))),
        }
    }

    /// Sends one message as a single uninterruptible frame.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Closed`] after [`close`](Self::close), or
    /// the underlying serialization/I/O failure.
    pub async fn send(&self, msg: &Message) -> Result<(), WireError> {
        let payload = msg.to_wire()?;
        let mut guard = self.stream.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(WireError::Closed);
        };
        codec::write_frame(writer, &msg.channel, &msg.subject, &payload).await
    }

    /// Shuts the stream down. Safe to call any number of times.
    pub async fn close(&self) {
        if let Some(mut writer) = self.stream.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Returns `true` once the stream has been closed.
    #[must_use]
    pub async fn is_closed(&self) -> bool {
        self.stream.lock().await.is_none()
    }
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter").finish_non_exhaustive()
    }
}
