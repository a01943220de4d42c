//! Frame codec: one message per record on a byte stream.
//!
//! The codec is envelope-agnostic; [`read_frame`] / [`write_frame`]
//! move raw payload bytes, while [`read_message`] additionally opens
//! the label envelope into a [`Message`].

use crate::error::WireError;
use crate::message::Message;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload.
///
/// A driver declaring more than this is treated as broken rather than
/// allowed to make the daemon allocate unbounded memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One decoded frame: header fields plus the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Channel token from the header.
    pub channel: String,
    /// Subject token from the header.
    pub subject: String,
    /// Exactly `size` payload bytes; empty when `size == 0`.
    pub payload: Vec<u8>,
}

/// Reads one frame from the stream.
///
/// Returns `Ok(None)` on clean EOF at the header boundary: the peer
/// closed its end and no more frames will arrive.
///
/// # Errors
///
/// - [`WireError::BadHeader`] when the header line does not parse
/// - [`WireError::Oversized`] when the declared size exceeds
///   [`MAX_FRAME_SIZE`]
/// - [`WireError::Truncated`] when the stream ends mid-payload
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<RawFrame>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = String::new();
    if reader.read_line(&mut header).await? == 0 {
        return Ok(None);
    }

    let mut tokens = header.split_ascii_whitespace();
    let (Some(channel), Some(subject), Some(size), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(WireError::BadHeader(header.trim_end().to_string()));
    };
    let size: usize = size
        .parse()
        .map_err(|_| WireError::BadHeader(header.trim_end().to_string()))?;
    if size > MAX_FRAME_SIZE {
        return Err(WireError::Oversized {
            size,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; size];
    if size > 0 {
        reader.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                WireError::Truncated
            } else {
                WireError::Io(err)
            }
        })?;
    }

    Ok(Some(RawFrame {
        channel: channel.to_string(),
        subject: subject.to_string(),
        payload,
    }))
}

/// Writes one frame to the stream and flushes it.
///
/// The caller is responsible for mutual exclusion between concurrent
/// writers; see [`MessageWriter`](crate::MessageWriter). `channel` and
/// `subject` must not contain whitespace.
pub async fn write_frame<W>(
    writer: &mut W,
    channel: &str,
    subject: &str,
    payload: &[u8],
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("{channel} {subject} {}\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads one frame and opens its label envelope into a [`Message`].
///
/// The resulting payload is raw; decoding stays with the consumer.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(frame) = read_frame(reader).await? else {
        return Ok(None);
    };
    Message::from_wire(frame.channel, frame.subject, &frame.payload).map(Some)
}
