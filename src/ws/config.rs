#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use rand::Rng as _;

const DEFAULT_HEARTBEAT_OUTGOING_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INCOMING_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_HANDSHAKE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_CLOSE_TIMEOUT_DURATION: Duration = Duration::from_secs(2);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MAX_JITTER_DURATION: Duration = Duration::from_secs(1);

/// Configuration for a single STOMP-over-WebSocket session.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// How often we promise to send heartbeats. Zero disables them.
    pub heartbeat_outgoing: Duration,
    /// How often we want the broker to send heartbeats. Zero disables them.
    pub heartbeat_incoming: Duration,
    /// Deadline covering both the transport open and the wait for `CONNECTED`
    pub handshake_timeout: Duration,
    /// Maximum time spent on a graceful teardown before the session task is aborted
    pub close_timeout: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_outgoing: DEFAULT_HEARTBEAT_OUTGOING_DURATION,
            heartbeat_incoming: DEFAULT_HEARTBEAT_INCOMING_DURATION,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT_DURATION,
            close_timeout: DEFAULT_CLOSE_TIMEOUT_DURATION,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Value of the `heart-beat` header sent with `CONNECT`, in milliseconds.
    #[must_use]
    pub fn heartbeat_header(&self) -> (u64, u64) {
        (
            saturating_millis(self.heartbeat_outgoing),
            saturating_millis(self.heartbeat_incoming),
        )
    }
}

/// Configuration for automatic reconnection after unexpected closures.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of scheduled reconnection attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Upper bound for any reconnection delay, jitter included
    pub max_delay: Duration,
    /// Upper bound of the uniformly random delay added to every attempt
    pub max_jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
            max_jitter: DEFAULT_MAX_JITTER_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given 1-based attempt: `min(base * 2^(attempt-1) + jitter, max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let exponential = self.base_delay.saturating_mul(factor);

        let jitter_ms = saturating_millis(self.max_jitter);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_ms));

        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Negotiated heartbeat periods: `(outgoing, incoming)`; `None` means disabled.
///
/// Each side sends at the slower of what it offers and what the other side wants.
#[must_use]
pub fn negotiate_heartbeat(
    client: (u64, u64),
    server: (u64, u64),
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (pick(client.0, server.1), pick(client.1, server.0))
}

/// Parses a `heart-beat` header value such as `10000,10000`.
#[must_use]
pub fn parse_heartbeat(value: Option<&str>) -> (u64, u64) {
    value
        .and_then(|v| v.split_once(','))
        .and_then(|(a, b)| Some((a.trim().parse().ok()?, b.trim().parse().ok()?)))
        .unwrap_or((0, 0))
}
