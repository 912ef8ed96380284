//! Core WebSocket infrastructure.
//!
//! This module owns the transport: connecting, heartbeat, reconnection with
//! exponential backoff, and the seams the feed layer plugs into.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: WebSocket connection lifecycle and reconnection
//! - [`Handler`]: receives open and frame events from the connection
//! - [`FrameSink`]: where subscribe/unsubscribe control frames are written
//!
//! # Example
//!
//! ```ignore
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_open(&self, _sink: &dyn FrameSink) {}
//!     fn on_frame(&self, text: &str) { println!("{text}") }
//! }
//!
//! let connection = ConnectionManager::new(Config::default(), Printer);
//! connection.connect().await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;

pub use connection::ConnectionManager;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
