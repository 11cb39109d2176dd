#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::ws::config::Config as SessionConfig;

/// Environment variable holding a complete endpoint URL that bypasses derivation.
pub const WS_URL_VAR: &str = "REALTIME_CHAT_WS_URL";
/// Environment variable holding the broker host (and optional port).
pub const HOST_VAR: &str = "REALTIME_CHAT_HOST";
/// Environment variable selecting `wss` (`true`/`1`) or `ws` (`false`/`0`).
pub const SECURE_VAR: &str = "REALTIME_CHAT_SECURE";

const DEFAULT_HOST: &str = "localhost:8080";
const DEFAULT_PREFIX: &str = "/ws/chat";

const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INITIAL_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_MAX_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// Top level configuration shared by every manager a [`super::Registry`] creates.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Where the transport connects
    pub endpoint: Endpoint,
    /// Destination templates for subscriptions and outbound frames
    pub destinations: Destinations,
    /// Session, heartbeat and reconnection behavior of each manager
    pub connection: SessionConfig,
    /// Retry policy layered by [`super::Client`] around its own `connect()` calls
    pub retry: RetryConfig,
}

/// Transport endpoint settings.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Complete URL used verbatim (after `{identity}` substitution) when set
    pub url_override: Option<String>,
    /// `wss` when true, `ws` otherwise
    pub secure: bool,
    /// Host and optional port, e.g. `chat.example.com` or `localhost:8080`
    pub host: String,
    /// Path prefix the identity is appended to
    pub prefix: String,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            url_override: None,
            secure: false,
            host: DEFAULT_HOST.to_owned(),
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }
}

impl Endpoint {
    /// Builds an endpoint from [`WS_URL_VAR`], [`HOST_VAR`] and [`SECURE_VAR`], falling back to
    /// the defaults for anything unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let defaults = Self::default();
        Self {
            url_override: lookup(WS_URL_VAR).filter(|url| !url.trim().is_empty()),
            secure: lookup(SECURE_VAR)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.secure),
            host: lookup(HOST_VAR)
                .filter(|host| !host.trim().is_empty())
                .unwrap_or(defaults.host),
            prefix: defaults.prefix,
        }
    }

    /// Endpoint pointing at a full URL; `{identity}` placeholders are substituted at connect time.
    #[must_use]
    pub fn with_url<S: Into<String>>(url: S) -> Self {
        Self {
            url_override: Some(url.into()),
            ..Self::default()
        }
    }
}

/// Destination templates. Every `{identity}` placeholder is resolved at subscribe time.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Destinations {
    pub direct_messages: String,
    pub conversation_updates: String,
    pub presence: String,
    /// Shared broadcast topic, identical for every identity
    pub typing: String,
    /// Outbound destination of [`super::ConnectionManager::send`]
    pub send_message: String,
    pub send_read_receipt: String,
    pub send_typing_status: String,
}

impl Default for Destinations {
    fn default() -> Self {
        Self {
            direct_messages: "/user/{identity}/queue/messages".to_owned(),
            conversation_updates: "/user/{identity}/queue/conversations".to_owned(),
            presence: "/user/{identity}/queue/status".to_owned(),
            typing: "/topic/typing".to_owned(),
            send_message: "/app/chat.send".to_owned(),
            send_read_receipt: "/app/chat.read".to_owned(),
            send_typing_status: "/app/chat.typing".to_owned(),
        }
    }
}

impl Destinations {
    /// The four templates every connected identity subscribes to, in subscription order.
    #[must_use]
    pub fn subscriptions(&self) -> [&str; 4] {
        [
            &self.direct_messages,
            &self.conversation_updates,
            &self.presence,
            &self.typing,
        ]
    }
}

/// Bounded retry around consumer-initiated connection attempts.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of follow-up attempts after a failed `connect()`
    pub max_attempts: u32,
    /// Initial backoff duration for the first retry
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_backoff: DEFAULT_RETRY_INITIAL_DURATION,
            max_backoff: DEFAULT_RETRY_MAX_DURATION,
            backoff_multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

impl From<RetryConfig> for ExponentialBackoff {
    fn from(config: RetryConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // attempts are bounded by max_attempts instead
            .build()
    }
}
