//! Live ticker, candle and portfolio explorer.
//!
//! Connects to the feed server, subscribes a few feeds and logs what arrives
//! along with connection state changes. Point it at a server with:
//!
//! ```sh
//! TRADEDESK_WS_URL=ws://localhost:8080/ws RUST_LOG=info cargo run --example ticker
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tradedesk_realtime::feed::{Channel, Client, MessageType};
use tradedesk_realtime::ws::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let client = Client::new(Config::default())?;
    info!(endpoint = %client.config().url, state = client.state().as_str());

    let mut states = client.state_receiver();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(state = state.as_str(), "Connection state changed");
        }
    });

    let btc = client.subscribe_ticker("BTCUSDT", |msg| {
        info!(feed = %msg.channel, last = %msg.data["last"], bid = %msg.data["bid"], ask = %msg.data["ask"]);
    });
    let eth = client.subscribe_ticker("ETHUSDT", |msg| {
        info!(feed = %msg.channel, last = %msg.data["last"]);
    });

    // Two consumers of the same candles share one server-side subscription
    let candles = client.subscribe(Channel::Kline, Some("BTCUSDT"), Some("1m"));
    let chart = candles.attach(|msg| info!(consumer = "chart", close = %msg.data["close"]));
    let table = candles.attach(|msg| debug!(consumer = "table", candle = %msg.data));

    let portfolio = client.subscribe_portfolio(|msg| {
        info!(feed = "portfolio", at = ?msg.time(), data = %msg.data);
    });

    let errors = client.on_message(|msg| {
        if msg.kind == MessageType::Error {
            warn!(channel = %msg.channel, error = %msg.data, "Server reported an error");
        }
    });

    client.connect().await?;
    info!(subscriptions = client.subscription_count(), "Connected");

    let mut stream = Box::pin(client.messages());
    let mut count = 0;
    while let Ok(Some(result)) = timeout(Duration::from_secs(10), stream.next()).await {
        match result {
            Ok(msg) => {
                count += 1;
                debug!(stream = "messages", channel = %msg.channel, kind = ?msg.kind);
                if count >= 50 {
                    break;
                }
            }
            Err(e) => {
                warn!(stream = "messages", error = %e);
                break;
            }
        }
    }
    info!(stream = "messages", received = count);

    table.unsubscribe();
    chart.unsubscribe();
    eth.unsubscribe();
    btc.unsubscribe();
    portfolio.unsubscribe();
    errors.unsubscribe();

    info!(
        subscriptions = client.subscription_count(),
        "Unsubscribed, disconnecting"
    );
    client.disconnect();

    Ok(())
}
