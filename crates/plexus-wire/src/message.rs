//! The message passed between the daemon and its drivers.
//!
//! A [`Message`] travels the wire with a raw byte payload; in memory
//! the payload may be decoded into structured JSON exactly once via
//! [`Message::deserialize_payload`]. Components that only route a
//! message never pay the decode cost.

use crate::envelope;
use crate::error::WireError;
use serde_json::Value;
use std::collections::HashMap;

/// Control-plane channel for driver state transitions.
pub const CHANNEL_STATE: &str = "state";
/// Control-plane channel for daemon-to-driver commands.
pub const CHANNEL_COMMAND: &str = "command";
/// Channel for cross-feature RPC.
pub const CHANNEL_RPC: &str = "rpc";
/// Channel for daemon-wide lifecycle broadcasts.
pub const CHANNEL_BROADCAST: &str = "broadcast";
/// Channel for API invocations.
pub const CHANNEL_API: &str = "api";
/// Channel carrying event traffic between services.
pub const CHANNEL_EVENTBUS: &str = "eventbus";

/// Driver signals readiness.
pub const SUBJECT_ALIVE: &str = "alive";
/// Driver requests a cold reload of itself.
pub const SUBJECT_COLD: &str = "cold";
/// Driver acknowledges a graceful stop.
pub const SUBJECT_STOPPED: &str = "stopped";
/// Daemon pushes a configuration snapshot to a driver.
pub const SUBJECT_OPTIONS: &str = "options";
/// Daemon asks a driver to shut down gracefully.
pub const SUBJECT_STOP: &str = "stop";
/// RPC invocation.
pub const SUBJECT_CALL: &str = "call";
/// RPC result.
pub const SUBJECT_RETURN: &str = "return";
/// Daemon lifecycle broadcast.
pub const SUBJECT_RELOAD: &str = "reload";

/// Label naming the RPC target (or API) feature.
pub const LABEL_FEATURE: &str = "feature";
/// Label naming the feature an RPC call originated from.
pub const LABEL_CALLER: &str = "caller";
/// Label naming the API method on `api:call`.
pub const LABEL_FN: &str = "fn";
/// Label naming the RPC method on `rpc:call`.
pub const LABEL_METHOD: &str = "method";
/// Label correlating an RPC call with its return.
pub const LABEL_RPC_ID: &str = "rpcID";
/// Label targeting a broadcast at one daemon instance.
pub const LABEL_DAEMON_ID: &str = "daemonID";
/// Label carrying a remote error on `rpc:return`.
pub const LABEL_ERROR: &str = "error";

/// Caller label value for in-process calls: the return is resolved
/// locally instead of being forwarded to a driver runtime.
pub const NO_CALLER: &str = "-";

/// Message payload in one of its two lifecycles stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Undecoded bytes as they travelled the wire.
    Raw(Vec<u8>),
    /// Structured form after [`Message::deserialize_payload`].
    Decoded(Value),
}

/// The unit of communication between daemon components and drivers.
///
/// # Example
///
/// ```
/// use plexus_wire::Message;
/// use serde_json::json;
///
/// let msg = Message::new("rpc", "call")
///     .with_label("feature", "kv")
///     .with_value(json!({"key": "host"}));
/// assert_eq!(msg.label("feature"), Some("kv"));
/// assert!(!msg.is_raw());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Identifier of the communication plane (e.g. `rpc`, `state`).
    pub channel: String,
    /// Operation within the channel (e.g. `call`, `alive`).
    pub subject: String,
    /// Out-of-band routing metadata.
    pub labels: HashMap<String, String>,
    /// Payload, raw off the wire or decoded in memory.
    pub payload: Option<Payload>,
    /// Byte length of the raw payload in transit; 0 when absent.
    pub size: usize,
}

impl Message {
    /// Creates an empty message on the given channel and subject.
    #[must_use]
    pub fn new(channel: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets a decoded payload.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.payload = Some(Payload::Decoded(value));
        self
    }

    /// Sets a raw payload (bytes must be valid JSON to travel the wire).
    #[must_use]
    pub fn with_raw(mut self, bytes: Vec<u8>) -> Self {
        self.size = bytes.len();
        self.payload = Some(Payload::Raw(bytes));
        self
    }

    /// Returns a label value.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Returns `true` while the payload is still undecoded bytes.
    #[must_use]
    pub fn is_raw(&self) -> bool {
        matches!(self.payload, Some(Payload::Raw(_)))
    }

    /// Returns the decoded payload, if the message has been decoded.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        match &self.payload {
            Some(Payload::Decoded(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the raw payload bytes, if still undecoded.
    #[must_use]
    pub fn raw(&self) -> Option<&[u8]> {
        match &self.payload {
            Some(Payload::Raw(b)) => Some(b),
            _ => None,
        }
    }

    /// Decodes a raw payload into its structured form, in place.
    ///
    /// Idempotent: an already-decoded or absent payload is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::BadPayload`] when the raw bytes are not
    /// valid JSON.
    pub fn deserialize_payload(&mut self) -> Result<(), WireError> {
        if let Some(Payload::Raw(bytes)) = &self.payload {
            if bytes.is_empty() {
                self.payload = None;
            } else {
                let value: Value = serde_json::from_slice(bytes)?;
                self.payload = Some(Payload::Decoded(value));
            }
        }
        Ok(())
    }

    /// Serializes the message payload for transit.
    ///
    /// A message with no labels and no payload travels as a bare
    /// `size == 0` frame; anything else becomes the JSON envelope.
    pub(crate) fn to_wire(&self) -> Result<Vec<u8>, WireError> {
        let content = match &self.payload {
            None => None,
            Some(Payload::Raw(bytes)) => Some(bytes.clone()),
            Some(Payload::Decoded(value)) => Some(serde_json::to_vec(value)?),
        };
        if self.labels.is_empty() && content.is_none() {
            return Ok(Vec::new());
        }
        envelope::seal(&self.labels, content.as_deref())
    }

    /// Rebuilds a message from a decoded frame.
    pub(crate) fn from_wire(
        channel: String,
        subject: String,
        payload: &[u8],
    ) -> Result<Self, WireError> {
        if payload.is_empty() {
            return Ok(Self {
                channel,
                subject,
                ..Self::default()
            });
        }
        let (labels, content) = envelope::open(payload)?;
        Ok(Self {
            channel,
            subject,
            labels,
            size: payload.len(),
            payload: content.map(Payload::Raw),
        })
    }
}
