use bon::Builder;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use serde_with::serde_as;

use super::request::TypingStatusMessage;
use crate::serde_helpers::{StringFromAny, deserialize_with_warnings};

/// Presence of an identity as broadcast by the broker.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserStatus {
    #[serde(alias = "ONLINE")]
    Online,
    #[serde(alias = "OFFLINE")]
    Offline,
    #[serde(alias = "AWAY")]
    Away,
}

/// A chat message authored elsewhere and pushed to this identity.
#[non_exhaustive]
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde_as(as = "StringFromAny")]
    #[builder(into)]
    pub id: String,
    #[serde_as(as = "StringFromAny")]
    #[builder(into)]
    pub conversation_id: String,
    #[serde_as(as = "StringFromAny")]
    #[builder(into)]
    pub sender_id: String,
    #[serde(default)]
    #[builder(into)]
    pub sender_name: Option<String>,
    #[serde(default)]
    #[builder(into, default)]
    pub content: String,
    #[serde(default, alias = "sentAt")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Summary change of a conversation (new last message, unread count, ...).
#[non_exhaustive]
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    #[serde_as(as = "StringFromAny")]
    #[builder(into)]
    pub conversation_id: String,
    #[serde(default)]
    pub last_message: Option<ChatMessage>,
    #[serde(default)]
    pub unread_count: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A peer's presence changed.
#[non_exhaustive]
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusChange {
    #[serde_as(as = "StringFromAny")]
    pub user_id: String,
    pub status: UserStatus,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Type discriminant of an inbound body.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum InboundKind {
    Message,
    ConversationUpdate,
    TypingStatus,
    UserStatus,
}

impl InboundKind {
    /// Maps a wire discriminant; `None` for types this client does not handle.
    #[must_use]
    pub fn from_wire(discriminant: &str) -> Option<Self> {
        Some(match discriminant.to_ascii_uppercase().as_str() {
            "MESSAGE" | "NEW_MESSAGE" | "CHAT_MESSAGE" => Self::Message,
            "CONVERSATION_UPDATE" | "CONVERSATION_UPDATED" => Self::ConversationUpdate,
            "TYPING" | "TYPING_STATUS" => Self::TypingStatus,
            "USER_STATUS" | "USER_STATUS_CHANGE" | "PRESENCE" => Self::UserStatus,
            _ => return None,
        })
    }
}

/// Inbound body split into its discriminant and payload.
///
/// Parsed, routed, then discarded.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    pub message_type: String,
    pub payload: Value,
}

impl InboundEnvelope {
    /// Splits a JSON body into discriminant and payload.
    ///
    /// The payload is the nested `payload` object when present, otherwise the remaining inline
    /// fields.
    pub fn parse(body: &str) -> Result<Self, InboundError> {
        let value: Value = serde_json::from_str(body)?;
        let Value::Object(mut fields) = value else {
            return Err(InboundError::Malformed("body is not a JSON object".to_owned()));
        };

        let message_type = match fields.remove("type") {
            Some(Value::String(message_type)) => message_type,
            Some(other) => {
                return Err(InboundError::Malformed(format!(
                    "`type` must be a string, got {other}"
                )));
            }
            None => return Err(InboundError::Malformed("missing `type`".to_owned())),
        };

        let payload = match fields.remove("payload") {
            Some(payload @ Value::Object(_)) => payload,
            _ => Value::Object(fields),
        };

        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Deserializes the payload into the typed event for this discriminant.
    ///
    /// Returns `Ok(None)` when the discriminant is not one this client routes.
    pub fn into_event(self) -> Result<Option<InboundEvent>, InboundError> {
        let Some(kind) = InboundKind::from_wire(&self.message_type) else {
            return Ok(None);
        };

        let event = match kind {
            InboundKind::Message => InboundEvent::Message(deserialize_with_warnings(self.payload)?),
            InboundKind::ConversationUpdate => {
                InboundEvent::ConversationUpdate(deserialize_with_warnings(self.payload)?)
            }
            InboundKind::TypingStatus => {
                InboundEvent::TypingStatus(deserialize_with_warnings(self.payload)?)
            }
            InboundKind::UserStatus => {
                InboundEvent::UserStatus(deserialize_with_warnings(self.payload)?)
            }
        };
        Ok(Some(event))
    }
}

/// A routed inbound event. Exactly one handler slot receives each variant.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(ChatMessage),
    ConversationUpdate(ConversationUpdate),
    TypingStatus(TypingStatusMessage),
    UserStatus(UserStatusChange),
}

impl InboundEvent {
    #[must_use]
    pub const fn kind(&self) -> InboundKind {
        match self {
            Self::Message(_) => InboundKind::Message,
            Self::ConversationUpdate(_) => InboundKind::ConversationUpdate,
            Self::TypingStatus(_) => InboundKind::TypingStatus,
            Self::UserStatus(_) => InboundKind::UserStatus,
        }
    }
}

/// Why an inbound body could not be routed.
#[non_exhaustive]
#[derive(Debug)]
pub enum InboundError {
    /// Body is not JSON, or the payload does not match the discriminant's shape
    Json(serde_json::Error),
    /// Body is JSON but lacks the envelope structure
    Malformed(String),
}

impl std::fmt::Display for InboundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid inbound payload: {e}"),
            Self::Malformed(reason) => write!(f, "malformed inbound envelope: {reason}"),
        }
    }
}

impl std::error::Error for InboundError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            Self::Malformed(_) => None,
        }
    }
}

impl From<serde_json::Error> for InboundError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<InboundError> for crate::error::Error {
    fn from(e: InboundError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Subscription, e)
    }
}

/// Parses and types an inbound body in one step.
pub fn parse_event(body: &str) -> Result<Option<InboundEvent>, InboundError> {
    InboundEnvelope::parse(body)?.into_event()
}
