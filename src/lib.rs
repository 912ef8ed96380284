#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod feed;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable naming the default feed endpoint.
pub const WS_URL_VAR: &str = "TRADEDESK_WS_URL";

/// Endpoint used when [`WS_URL_VAR`] is not set.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";
