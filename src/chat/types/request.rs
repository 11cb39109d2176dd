use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Typing indicator state carried by [`TypingStatusMessage`].
#[non_exhaustive]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TypingStatus {
    /// The user is composing a message
    #[serde(alias = "TYPING")]
    Typing,
    /// The user stopped composing without sending
    #[serde(alias = "STOPPED")]
    Stopped,
    /// The user sent the message they were composing
    #[serde(alias = "SENT")]
    Sent,
}

impl From<bool> for TypingStatus {
    fn from(is_typing: bool) -> Self {
        if is_typing { Self::Typing } else { Self::Stopped }
    }
}

/// Typing indicator, published on the typing destination and broadcast to peers.
///
/// # Example
///
/// ```
/// use realtime_chat::chat::types::request::{TypingStatus, TypingStatusMessage};
///
/// let message = TypingStatusMessage::builder()
///     .conversation_id("c1")
///     .user_id("u1")
///     .status(TypingStatus::Typing)
///     .build();
///
/// let json = serde_json::to_value(&message).unwrap();
/// assert_eq!(json["status"], "typing");
/// assert!(json.get("userName").is_none());
/// ```
#[non_exhaustive]
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatusMessage {
    #[builder(into)]
    pub conversation_id: String,
    #[builder(into)]
    pub user_id: String,
    #[builder(into)]
    pub user_name: Option<String>,
    pub status: TypingStatus,
    /// Milliseconds since the Unix epoch on the wire
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
}

/// Confirmation that `reader_id` has read `message_id`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptMessage {
    #[builder(into)]
    pub message_id: String,
    #[builder(into)]
    pub conversation_id: String,
    #[builder(into)]
    pub reader_id: String,
    #[builder(default = Utc::now())]
    pub read_timestamp: DateTime<Utc>,
}

/// A serialized payload addressed to a broker destination.
///
/// Built per send call and dropped once written.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub destination: String,
    pub body: String,
}

impl OutboundEnvelope {
    pub fn new<T: Serialize + ?Sized>(destination: &str, payload: &T) -> serde_json::Result<Self> {
        Ok(Self {
            destination: destination.to_owned(),
            body: serde_json::to_string(payload)?,
        })
    }
}
