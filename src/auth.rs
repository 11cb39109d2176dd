//! Credential plumbing for the broker handshake.

/// Secret string type that redacts its value in debug output.
pub use secrecy::{ExposeSecret, SecretString};

/// Supplies the bearer token sent with every handshake.
///
/// The provider is asked once per handshake, never when the transport is opened, so a token
/// refreshed between reconnection attempts is picked up automatically. Returning `None` performs
/// an anonymous handshake.
///
/// Any `Fn() -> Option<SecretString>` closure is a provider:
///
/// ```
/// use realtime_chat::auth::{SecretString, TokenProvider};
///
/// let provider = || Some(SecretString::from("token".to_owned()));
/// assert!(provider.token().is_some());
/// ```
pub trait TokenProvider: Send + Sync + 'static {
    fn token(&self) -> Option<SecretString>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<SecretString> + Send + Sync + 'static,
{
    fn token(&self) -> Option<SecretString> {
        self()
    }
}

/// A provider that always hands out the same token.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct StaticToken(SecretString);

impl StaticToken {
    #[must_use]
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self(SecretString::from(token.into()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

/// A provider for brokers that accept anonymous sessions.
///
/// ```
/// use realtime_chat::auth::{Anonymous, TokenProvider as _};
///
/// assert!(Anonymous.token().is_none());
/// ```
#[expect(
    clippy::exhaustive_structs,
    reason = "Unit provider that callers construct by name"
)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Anonymous;

impl TokenProvider for Anonymous {
    fn token(&self) -> Option<SecretString> {
        None
    }
}
