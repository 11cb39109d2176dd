#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Transport and protocol level failures of a STOMP-over-WebSocket session.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing the JSON body of a frame
    MessageParse(serde_json::Error),
    /// Received bytes that are not a well-formed STOMP frame
    InvalidFrame(String),
    /// The broker answered the handshake with something other than `CONNECTED` or `ERROR`
    Protocol(String),
    /// The broker answered the handshake with an `ERROR` frame
    HandshakeRejected {
        /// `message` header (or body) of the broker's `ERROR` frame
        message: String,
    },
    /// WebSocket connection was closed without our request
    ConnectionClosed {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason sent by the peer
        reason: String,
    },
    /// Handshake or heartbeat deadline elapsed
    Timeout,
}

impl WsError {
    /// Whether a rejected handshake looks like a credential problem.
    #[must_use]
    pub fn is_auth_rejection(&self) -> bool {
        let Self::HandshakeRejected { message } = self else {
            return false;
        };
        let message = message.to_ascii_lowercase();
        ["401", "403", "unauthorized", "forbidden", "authentication", "token"]
            .iter()
            .any(|needle| message.contains(needle))
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse message body: {e}"),
            Self::InvalidFrame(reason) => write!(f, "Invalid STOMP frame: {reason}"),
            Self::Protocol(reason) => write!(f, "STOMP handshake failed: {reason}"),
            Self::HandshakeRejected { message } => {
                write!(f, "Broker rejected the handshake: {message}")
            }
            Self::ConnectionClosed { code, reason } => match code {
                Some(code) => write!(f, "WebSocket connection closed ({code}): {reason}"),
                None => write!(f, "WebSocket connection closed"),
            },
            Self::Timeout => write!(f, "WebSocket operation timed out"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(e)
    }
}

impl From<serde_json::Error> for WsError {
    fn from(e: serde_json::Error) -> Self {
        Self::MessageParse(e)
    }
}
