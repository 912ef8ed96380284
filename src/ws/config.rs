#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::sync::LazyLock;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

use crate::{DEFAULT_WS_URL, WS_URL_VAR};

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_RECONNECT_INTERVAL_DURATION: Duration = Duration::from_millis(2000);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(600);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;

/// Endpoint read from [`WS_URL_VAR`] on first use.
static DEFAULT_ENDPOINT: LazyLock<String> =
    LazyLock::new(|| std::env::var(WS_URL_VAR).unwrap_or_else(|_| DEFAULT_WS_URL.to_owned()));

/// The endpoint used when a [`Config`] does not name one.
#[must_use]
pub fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.clone()
}

/// Configuration for the feed client.
///
/// ```
/// use std::time::Duration;
/// use tradedesk_realtime::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .url("ws://127.0.0.1:9000/ws")
///     .reconnect(
///         ReconnectConfig::builder()
///             .interval(Duration::from_millis(500))
///             .max_attempts(3)
///             .build(),
///     )
///     .build();
/// assert_eq!(config.reconnect.max_attempts, 3);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// WebSocket endpoint (`ws://` or `wss://`)
    #[builder(into, default = default_endpoint())]
    pub url: String,
    /// Interval for sending PING frames to keep the connection alive
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for a PONG before considering the connection dead
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT_DURATION)]
    pub heartbeat_timeout: Duration,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection after an unexpected close.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Whether unexpected closes schedule a reconnect at all
    #[builder(default = true)]
    pub enabled: bool,
    /// Delay before the first reconnection attempt
    #[builder(default = DEFAULT_RECONNECT_INTERVAL_DURATION)]
    pub interval: Duration,
    /// Reconnection attempts allowed before giving up. Reset on every successful open.
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_attempts: u32,
    /// Multiplier applied to the delay after each attempt
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
    /// Upper bound for a single delay
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.interval)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn backoff_sequence() {
        let config = ReconnectConfig::builder()
            .interval(Duration::from_millis(100))
            .build();
        let mut backoff: ExponentialBackoff = config.into();

        let delays: Vec<u128> = (0..4)
            .map(|_| backoff.next_backoff().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 150, 225, 337]);
    }

    #[test]
    fn backoff_respects_max() {
        let config = ReconnectConfig {
            enabled: true,
            interval: Duration::from_secs(1),
            max_attempts: 10,
            backoff_multiplier: 3.0,
            max_backoff: Duration::from_secs(2),
        };
        let mut backoff: ExponentialBackoff = config.into();

        for _ in 0..10 {
            let _next = backoff.next_backoff();
        }

        let duration = backoff.next_backoff().unwrap();
        assert!(duration <= Duration::from_secs(2) + Duration::from_millis(1));
    }

    #[test]
    fn backoff_reset_restarts_from_interval() {
        let mut backoff: ExponentialBackoff = ReconnectConfig::default().into();
        let _first = backoff.next_backoff();
        let _second = backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.next_backoff().unwrap().as_millis(), 2000);
    }

    #[test]
    fn reconnect_defaults() {
        let config = ReconnectConfig::default();

        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_millis(2000));
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn default_heartbeat_is_fifteen_seconds() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn builder_overrides_url() {
        let config = Config::builder().url("wss://feed.example.com/ws").build();
        assert_eq!(config.url, "wss://feed.example.com/ws");
    }
}
