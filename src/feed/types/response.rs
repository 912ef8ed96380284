use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an inbound frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Ticker,
    Kline,
    Trade,
    OrderBook,
    Portfolio,
    Risk,
    Error,
    Pong,
    Subscribe,
    Unsubscribe,
    /// Unknown message type from the server (captures the raw value for debugging).
    #[serde(untagged)]
    Unknown(String),
}

impl MessageType {
    /// Whether this is protocol traffic rather than feed data.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(
            self,
            Self::Error | Self::Pong | Self::Subscribe | Self::Unsubscribe
        )
    }
}

/// A message received from the feed server.
///
/// `channel` is the composed key of the feed it belongs to, e.g.
/// `ticker:BTCUSDT`, and is what routing matches on.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub channel: String,
    /// Feed-specific payload
    #[serde(default)]
    pub data: Value,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub timestamp: i64,
}

impl InboundMessage {
    /// Deserialize the payload into a concrete type.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` does not have the shape of `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(T::deserialize(&self.data)?)
    }

    /// The message timestamp, if it is a representable instant.
    #[must_use]
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Deserialize messages from the byte slice.
///
/// Handles both single objects and arrays of messages.
/// Returns an empty vector for empty or whitespace-only input.
pub fn parse_messages(bytes: &[u8]) -> crate::Result<Vec<InboundMessage>> {
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&[][..], |start| &bytes[start..]);

    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.first() == Some(&b'[') {
        Ok(serde_json::from_slice(trimmed)?)
    } else {
        let msg: InboundMessage = serde_json::from_slice(trimmed)?;
        Ok(vec![msg])
    }
}
