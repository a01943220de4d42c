//! Framed message protocol spoken between the plexus daemon and its
//! driver subprocesses.
//!
//! # Wire Format
//!
//! One message per record, bidirectional over a driver's stdio:
//!
//! ```text
//! <channel> <subject> <size>\n
//! <payload bytes, exactly `size` of them; absent if size == 0>
//! ```
//!
//! Header tokens are whitespace-separated ASCII; `size` is a
//! non-negative decimal integer; there is no trailing newline after the
//! payload. Reading is strict: a malformed header is a protocol error,
//! EOF at the header boundary means the peer closed, EOF mid-payload is
//! fatal.
//!
//! # Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Message            labels + payload model    │
//! ├──────────────────────────────────────────────┤
//! │ envelope           {"labels":…,"content":…}  │
//! ├──────────────────────────────────────────────┤
//! │ codec              header framing            │
//! ├──────────────────────────────────────────────┤
//! │ MessageWriter      whole-frame write lock    │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Labels are not part of the frame header. When a frame carries a
//! payload, that payload is the JSON envelope produced by [`envelope`];
//! a `size == 0` frame has neither labels nor content.
//!
//! # Atomic Sends
//!
//! [`MessageWriter`] owns its underlying writer behind a lock held for
//! the whole header+payload write, so any number of concurrent senders
//! produce a clean sequence of frames.

pub mod codec;
pub mod envelope;

mod error;
mod message;
mod writer;

pub use codec::{read_frame, read_message, write_frame, RawFrame, MAX_FRAME_SIZE};
pub use error::WireError;
pub use message::{
    Message, Payload, CHANNEL_API, CHANNEL_BROADCAST, CHANNEL_COMMAND, CHANNEL_EVENTBUS,
    CHANNEL_RPC, CHANNEL_STATE, LABEL_CALLER, LABEL_DAEMON_ID, LABEL_ERROR, LABEL_FEATURE,
    LABEL_FN, LABEL_METHOD, LABEL_RPC_ID, NO_CALLER, SUBJECT_ALIVE, SUBJECT_CALL, SUBJECT_COLD,
    SUBJECT_OPTIONS, SUBJECT_RELOAD, SUBJECT_RETURN, SUBJECT_STOP, SUBJECT_STOPPED,
};
pub use writer::MessageWriter;
