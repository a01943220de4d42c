//! JSON envelope carrying labels alongside the payload.
//!
//! The frame header has no room for labels, so any frame with a
//! payload wraps it as:
//!
//! ```text
//! {"labels":{"rpcID":"421.7"},"content":{...}}
//! ```
//!
//! `content` is kept as a raw JSON slice on both paths so that opening
//! an envelope does not decode the payload; that stays the business of
//! [`Message::deserialize_payload`](crate::Message::deserialize_payload).

use crate::error::WireError;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

#[derive(Serialize)]
struct SealedEnvelope<'a> {
    labels: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a RawValue>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OpenedEnvelope<'a> {
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(borrow, default)]
    content: Option<&'a RawValue>,
}

/// Serializes labels and raw JSON content into envelope bytes.
///
/// # Errors
///
/// Returns [`WireError::BadPayload`] when `content` is not valid JSON.
pub fn seal(labels: &HashMap<String, String>, content: Option<&[u8]>) -> Result<Vec<u8>, WireError> {
    let raw: Option<&RawValue> = match content {
        Some(bytes) => Some(serde_json::from_slice(bytes)?),
        None => None,
    };
    let sealed = SealedEnvelope {
        labels,
        content: raw,
    };
    Ok(serde_json::to_vec(&sealed)?)
}

/// Parses envelope bytes back into labels and raw content bytes.
///
/// # Errors
///
/// Returns [`WireError::BadPayload`] when the bytes are not an
/// envelope; drivers must speak the envelope on every non-empty frame.
pub fn open(bytes: &[u8]) -> Result<(HashMap<String, String>, Option<Vec<u8>>), WireError> {
    let opened: OpenedEnvelope<'_> = serde_json::from_slice(bytes)?;
    let content = opened.content.map(|raw| raw.get().as_bytes().to_vec());
    Ok((opened.labels, content))
}
