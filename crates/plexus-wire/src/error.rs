//! Wire layer errors.

use plexus_types::ErrorCode;
use thiserror::Error;

/// Failure while framing, parsing or transporting a message.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | [`WireError::BadHeader`] | `WIRE_BAD_HEADER` | No |
/// | [`WireError::Truncated`] | `WIRE_TRUNCATED` | No |
/// | [`WireError::Oversized`] | `WIRE_OVERSIZED` | No |
/// | [`WireError::BadPayload`] | `WIRE_BAD_PAYLOAD` | No |
/// | [`WireError::Closed`] | `WIRE_CLOSED` | No |
/// | [`WireError::Io`] | `WIRE_IO` | Yes |
#[derive(Debug, Error)]
pub enum WireError {
    /// The header line did not parse as `channel subject size`.
    #[error("invalid message header: {0:?}")]
    BadHeader(String),

    /// The stream ended before `size` payload bytes arrived.
    #[error("frame payload truncated")]
    Truncated,

    /// The declared payload size exceeds the frame budget.
    #[error("frame of {size} bytes exceeds the {max} byte budget")]
    Oversized {
        /// Declared payload size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The payload or envelope is not the JSON the protocol requires.
    #[error("invalid message payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    /// The writer has been closed; no further frames can be sent.
    #[error("message writer is closed")]
    Closed,

    /// An underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ErrorCode for WireError {
    fn code(&self) -> &'static str {
        match self {
            Self::BadHeader(_) => "WIRE_BAD_HEADER",
            Self::Truncated => "WIRE_TRUNCATED",
            Self::Oversized { .. } => "WIRE_OVERSIZED",
            Self::BadPayload(_) => "WIRE_BAD_PAYLOAD",
            Self::Closed => "WIRE_CLOSED",
            Self::Io(_) => "WIRE_IO",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
