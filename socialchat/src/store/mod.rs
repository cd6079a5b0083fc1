//! In-memory message log with a per-conversation index.
//!
//! Every inbound frame that carries a `type` becomes a [`Message`] and is
//! appended to the log. Text messages with both participants set are also
//! filed under their [`ConversationKey`], kept sorted by timestamp so a
//! conversation query is a copy of one index entry rather than a scan and
//! sort of the whole log.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use socialchat_proto::frame::{self, FrameError, InboundFrame, TEXT_KIND, WireTimestamp};
use socialchat_proto::id::UserId;

/// Client-side identity of a stored message.
///
/// Time-ordered with a random suffix. Only meant for UI list keys: it is not
/// stable across reconnects and the backend never sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(Uuid);

impl LocalId {
    fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat event accepted into the store. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Local list-key identity.
    pub local_id: LocalId,
    /// Event type, e.g. `"text"`. Never blank.
    pub kind: String,
    /// Author, if the frame named one.
    pub sender_id: Option<UserId>,
    /// Addressee, if the frame named one.
    pub receiver_id: Option<UserId>,
    /// Text body.
    pub content: Option<String>,
    /// Backend timestamp, or the ingestion instant when absent.
    pub timestamp: DateTime<Utc>,
    /// Wire fields without a dedicated slot above.
    pub extra: Map<String, Value>,
}

impl Message {
    /// Build a message from a decoded frame, stamping `now` when the frame
    /// has no usable timestamp.
    #[must_use]
    pub fn from_frame(frame: InboundFrame, now: DateTime<Utc>) -> Self {
        let timestamp = resolve_timestamp(frame.timestamp.as_ref(), now);
        Self {
            local_id: LocalId::generate(),
            kind: frame.kind,
            sender_id: frame.sender_id,
            receiver_id: frame.receiver_id,
            content: frame.content,
            timestamp,
            extra: frame.extra,
        }
    }

    /// Whether this is a chat text message.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.kind == TEXT_KIND
    }

    /// The conversation this message is filed under, if any.
    ///
    /// Only text messages with both participants set belong to one.
    #[must_use]
    pub fn conversation_key(&self) -> Option<ConversationKey> {
        if !self.is_text() {
            return None;
        }
        ConversationKey::between(self.sender_id.as_ref(), self.receiver_id.as_ref())
    }
}

/// Unordered pair of participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    /// Key for the conversation between `a` and `b`, in either order.
    ///
    /// Returns `None` when either side is missing or blank.
    #[must_use]
    pub fn between(a: Option<&UserId>, b: Option<&UserId>) -> Option<Self> {
        let a = a.filter(|id| !id.is_blank())?;
        let b = b.filter(|id| !id.is_blank())?;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Some(Self {
            low: low.clone(),
            high: high.clone(),
        })
    }

    /// Whether `id` takes part in this conversation.
    #[must_use]
    pub fn involves(&self, id: &UserId) -> bool {
        &self.low == id || &self.high == id
    }
}

/// Append-only message log queried per conversation.
#[derive(Debug, Default)]
pub struct MessageStore {
    /// All accepted messages in arrival order.
    log: Vec<Arc<Message>>,
    /// Text messages per conversation, ascending by timestamp, ties in
    /// arrival order.
    conversations: HashMap<ConversationKey, Vec<Arc<Message>>>,
}

impl MessageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an inbound text frame and append it.
    ///
    /// # Errors
    ///
    /// Returns the [`FrameError`] when the frame is not JSON or has no
    /// `type`; the store is left untouched.
    pub fn ingest(&mut self, text: &str, now: DateTime<Utc>) -> Result<Arc<Message>, FrameError> {
        let frame = frame::decode_inbound(text)?;
        Ok(self.append(Message::from_frame(frame, now)))
    }

    /// Append a message, filing it under its conversation.
    pub fn append(&mut self, message: Message) -> Arc<Message> {
        let message = Arc::new(message);
        if let Some(key) = message.conversation_key() {
            let thread = self.conversations.entry(key).or_default();
            let at = thread.partition_point(|m| m.timestamp <= message.timestamp);
            thread.insert(at, Arc::clone(&message));
        }
        self.log.push(Arc::clone(&message));
        message
    }

    /// Text messages exchanged between `peer` and `me`, oldest first.
    ///
    /// Empty when either ID is missing.
    #[must_use]
    pub fn conversation(&self, peer: Option<&UserId>, me: Option<&UserId>) -> Vec<Arc<Message>> {
        ConversationKey::between(peer, me)
            .and_then(|key| self.conversations.get(&key))
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every text message exchanged between `peer` and `me`.
    ///
    /// Returns how many messages were removed.
    pub fn clear_conversation(&mut self, peer: Option<&UserId>, me: Option<&UserId>) -> usize {
        let Some(key) = ConversationKey::between(peer, me) else {
            return 0;
        };
        let Some(removed) = self.conversations.remove(&key) else {
            return 0;
        };
        self.log
            .retain(|m| m.conversation_key().as_ref() != Some(&key));
        removed.len()
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.log.clear();
        self.conversations.clear();
    }

    /// Number of stored messages of any type.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

/// Turn a wire timestamp into an instant, falling back to `now`.
fn resolve_timestamp(raw: Option<&WireTimestamp>, now: DateTime<Utc>) -> DateTime<Utc> {
    match raw {
        None => now,
        Some(WireTimestamp::Text(text)) => parse_text_timestamp(text).unwrap_or_else(|| {
            tracing::warn!(timestamp = %text, "unparseable message timestamp, using receive time");
            now
        }),
        Some(WireTimestamp::Millis(ms)) => DateTime::from_timestamp_millis(*ms).unwrap_or_else(|| {
            tracing::warn!(timestamp = ms, "out of range message timestamp, using receive time");
            now
        }),
        Some(WireTimestamp::Other(value)) => {
            tracing::warn!(timestamp = %value, "unsupported message timestamp, using receive time");
            now
        }
    }
}

/// RFC 3339 first, then zone-less ISO forms read as UTC.
fn parse_text_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}
