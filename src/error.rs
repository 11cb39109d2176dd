use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::ws::WsError;

/// Classification of every failure surfaced by the messaging core.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Kind {
    /// Transport could not be opened, the handshake failed, or the session dropped
    #[strum(serialize = "ConnectionError")]
    Connection,
    /// The broker rejected the bearer credential during the handshake
    #[strum(serialize = "AuthenticationError")]
    Authentication,
    /// A write was attempted while not connected, or the transport write failed
    #[strum(serialize = "SendError")]
    Send,
    /// An inbound frame could not be parsed, or a topic subscription failed
    #[strum(serialize = "SubscriptionError")]
    Subscription,
    /// The automatic reconnection ceiling was exhausted
    #[strum(serialize = "ReconnectFailed")]
    ReconnectFailed,
    /// Anything that does not fit the categories above
    #[strum(serialize = "UnknownError")]
    Unknown,
}

impl Kind {
    /// Whether errors of this kind are retryable unless stated otherwise.
    #[must_use]
    pub const fn default_retryable(self) -> bool {
        match self {
            Self::Connection | Self::Authentication | Self::Send => true,
            Self::Subscription | Self::ReconnectFailed | Self::Unknown => false,
        }
    }
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    message: String,
    retryable: bool,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn new<S: Into<String>>(kind: Kind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            source: None,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            message: source.to_string(),
            retryable: kind.default_retryable(),
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    /// Overrides the retryable flag derived from the [`Kind`].
    #[must_use]
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    /// A cloneable summary suitable for storing in consumer-facing state.
    #[must_use]
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind,
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }

    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::new(Kind::Connection, message)
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::new(Kind::Authentication, message)
    }

    /// The error every `send*` call returns when the session is not connected.
    #[must_use]
    pub fn not_connected() -> Self {
        Self::new(Kind::Send, "cannot send while the connection is not established")
    }

    pub fn subscription<S: Into<String>>(message: S) -> Self {
        Self::new(Kind::Subscription, message)
    }

    #[must_use]
    pub fn reconnect_failed(attempts: u32) -> Self {
        Self::new(
            Kind::ReconnectFailed,
            format!("gave up reconnecting after {attempts} attempts"),
        )
    }

    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::new(Kind::Unknown, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Owned, cloneable projection of an [`Error`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSummary {
    pub kind: Kind,
    pub message: String,
    pub retryable: bool,
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        let kind = match &e {
            WsError::HandshakeRejected { .. } if e.is_auth_rejection() => Kind::Authentication,
            WsError::MessageParse(_) | WsError::InvalidFrame(_) => Kind::Subscription,
            WsError::Connection(_)
            | WsError::Protocol(_)
            | WsError::HandshakeRejected { .. }
            | WsError::ConnectionClosed { .. }
            | WsError::Timeout => Kind::Connection,
        };
        Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(e).into()
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Unknown, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Connection, e).retryable(false)
    }
}
