//! Multiplexed real-time feeds over a single WebSocket.
//!
//! # Available Feeds
//!
//! - **Ticker**: best bid/ask and last price per symbol
//! - **Kline**: candles per symbol and interval
//! - **Trade**: public trades per symbol
//! - **Order book**: depth updates per symbol
//! - **Portfolio** and **Risk**: account-wide updates
//!
//! # Example
//!
//! ```rust, no_run
//! use tradedesk_realtime::feed::Client;
//! use tradedesk_realtime::ws::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::new(Config::default())?;
//!
//!     let btc = client.subscribe_ticker("BTCUSDT", |msg| println!("{}", msg.data));
//!     let candles = client.subscribe_kline("BTCUSDT", "1m", |msg| println!("{}", msg.data));
//!
//!     client.connect().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!
//!     btc.unsubscribe();
//!     candles.unsubscribe();
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod registry;
pub mod router;
pub mod subscription;
pub mod types;

// Re-export commonly used types
pub use client::{Client, Feed, shared};
pub use registry::Callback;
pub use subscription::Unsubscribe;
pub use types::request::{Channel, ControlFrame, Operation, SubscriptionKey};
pub use types::response::{InboundMessage, MessageType};

pub use crate::ws::WsError;
