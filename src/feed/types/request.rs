use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Wire operation carried by a [`ControlFrame`].
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Operation {
    Subscribe,
    Unsubscribe,
}

/// Feeds the server publishes.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    Ticker,
    Kline,
    Trade,
    OrderBook,
    Portfolio,
    Risk,
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

/// Identifies one logical feed: a channel, optionally narrowed by symbol and interval.
///
/// The composed form `<channel>[:<symbol>][:<interval>]` (its [`Display`](fmt::Display))
/// is the key used both for bookkeeping and for routing inbound messages.
///
/// ```
/// use tradedesk_realtime::feed::{Channel, SubscriptionKey};
///
/// let key = SubscriptionKey::new(Channel::Kline, Some("BTCUSDT"), Some("1m"));
/// assert_eq!(key.to_string(), "kline:BTCUSDT:1m");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Bare channel name, e.g. `ticker`
    pub channel: String,
    pub symbol: Option<String>,
    pub interval: Option<String>,
}

impl SubscriptionKey {
    #[must_use]
    pub fn new<C: Into<String>>(channel: C, symbol: Option<&str>, interval: Option<&str>) -> Self {
        Self {
            channel: channel.into(),
            symbol: symbol.map(str::to_owned),
            interval: interval.map(str::to_owned),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel)?;
        if let Some(symbol) = &self.symbol {
            write!(f, ":{symbol}")?;
        }
        if let Some(interval) = &self.interval {
            write!(f, ":{interval}")?;
        }
        Ok(())
    }
}

/// Subscribe/unsubscribe request sent to the server.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub operation: Operation,
    /// Bare channel name, never the composed key
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl ControlFrame {
    /// Frame for `operation` on the feed identified by `key`.
    #[must_use]
    pub fn new(operation: Operation, key: &SubscriptionKey) -> Self {
        Self {
            operation,
            channel: key.channel.clone(),
            symbol: key.symbol.clone(),
            interval: key.interval.clone(),
        }
    }

    #[must_use]
    pub fn subscribe<C: Into<String>>(
        channel: C,
        symbol: Option<&str>,
        interval: Option<&str>,
    ) -> Self {
        Self::new(
            Operation::Subscribe,
            &SubscriptionKey::new(channel, symbol, interval),
        )
    }

    #[must_use]
    pub fn unsubscribe<C: Into<String>>(
        channel: C,
        symbol: Option<&str>,
        interval: Option<&str>,
    ) -> Self {
        Self::new(
            Operation::Unsubscribe,
            &SubscriptionKey::new(channel, symbol, interval),
        )
    }
}
