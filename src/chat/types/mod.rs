pub mod request;
pub mod response;

pub use request::{OutboundEnvelope, ReadReceiptMessage, TypingStatus, TypingStatusMessage};
pub use response::{
    ChatMessage, ConversationUpdate, InboundEnvelope, InboundError, InboundEvent, InboundKind,
    UserStatus, UserStatusChange, parse_event,
};
