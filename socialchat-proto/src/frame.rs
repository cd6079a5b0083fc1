//! JSON frames exchanged over the chat WebSocket.
//!
//! Outbound frames are commands tagged by an `action` field. Inbound frames
//! are loosely typed objects that must carry a `type` field; every field the
//! client does not model is kept in [`InboundFrame::extra`] so nothing the
//! backend sends is lost.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::UserId;

/// Inbound `type` tag used for chat text messages.
pub const TEXT_KIND: &str = "text";

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload is not valid JSON.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// The object has no usable `type` field and cannot be routed.
    #[error("frame has no type")]
    MissingType,
}

/// Commands the client sends to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum OutboundFrame {
    /// Deliver a text message to another user.
    #[serde(rename = "send", rename_all = "camelCase")]
    Send {
        /// Recipient of the message.
        receiver_id: UserId,
        /// Message body.
        content: String,
    },

    /// Ask the backend to replay one page of a conversation.
    ///
    /// The backend answers asynchronously with ordinary `text` frames.
    #[serde(rename = "gethistory", rename_all = "camelCase")]
    GetHistory {
        /// The other participant of the conversation.
        receiver_id: UserId,
        /// One-based page number.
        page: u32,
        /// Number of messages per page.
        page_size: u32,
    },
}

/// Timestamp as supplied by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    /// ISO-8601 / RFC 3339 string.
    Text(String),
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// Anything else; kept so the frame is not rejected.
    Other(Value),
}

/// A typed frame received from the backend.
///
/// Decoding is lenient once a `type` is present: a modelled field with an
/// unexpected shape is left as `None` and its raw value kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    /// Event type, e.g. `"text"`. A non-string tag is kept as its JSON text.
    #[serde(rename = "type")]
    pub kind: String,
    /// Author of the event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
    /// Addressee of the event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    /// Text body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Backend timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTimestamp>,
    /// Fields not modelled above, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Serializes an outbound command to the text carried by a WebSocket frame.
///
/// # Errors
///
/// Returns [`FrameError::Json`] if serialization fails.
pub fn encode(frame: &OutboundFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Parses the text of an inbound WebSocket frame.
///
/// # Errors
///
/// - [`FrameError::Json`] if the text is not JSON.
/// - [`FrameError::NotAnObject`] for arrays, strings and other scalars.
/// - [`FrameError::MissingType`] if `type` is absent, null or blank.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut fields) = value else {
        return Err(FrameError::NotAnObject);
    };
    let kind = match fields.remove("type") {
        None | Some(Value::Null) => return Err(FrameError::MissingType),
        Some(Value::String(kind)) if kind.trim().is_empty() => {
            return Err(FrameError::MissingType);
        }
        Some(Value::String(kind)) => kind,
        Some(other) => other.to_string(),
    };

    Ok(InboundFrame {
        kind,
        sender_id: take_field(&mut fields, "senderId"),
        receiver_id: take_field(&mut fields, "receiverId"),
        content: take_field(&mut fields, "content"),
        timestamp: take_field(&mut fields, "timestamp"),
        extra: fields,
    })
}

/// Remove `key` and decode it as `T`. On a shape mismatch the raw value
/// goes back into `fields`.
fn take_field<T: DeserializeOwned>(fields: &mut Map<String, Value>, key: &str) -> Option<T> {
    let raw = fields.remove(key)?;
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value(raw.clone()) {
        Ok(decoded) => Some(decoded),
        Err(_) => {
            fields.insert(key.to_string(), raw);
            None
        }
    }
}
