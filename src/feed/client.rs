use std::sync::{Arc, OnceLock};

use async_stream::try_stream;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use url::Url;

use super::registry::{Callback, Registry};
use super::router::Router;
use super::subscription::Unsubscribe;
use super::types::request::{Channel, SubscriptionKey};
use super::types::response::InboundMessage;
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::connection::ConnectionState;
use crate::ws::{ConnectionManager, WsError};

static SHARED: OnceLock<Client> = OnceLock::new();

/// The process-wide client, created from [`Config::default`] on first use.
///
/// Every call returns the same instance. Tests should build their own
/// [`Client`] instead, since this one can never be replaced.
///
/// # Errors
///
/// Returns an error if the default endpoint is not a valid `ws`/`wss` URL.
pub fn shared() -> Result<&'static Client> {
    if let Some(client) = SHARED.get() {
        return Ok(client);
    }

    let client = Client::new(Config::default())?;
    // A client that loses a creation race is dropped before it ever connects
    Ok(SHARED.get_or_init(|| client))
}

/// Real-time feed client multiplexing every feed over one WebSocket.
///
/// Cloning is cheap and every clone shares the same connection and
/// subscriptions.
///
/// # Examples
///
/// ```rust, no_run
/// use std::time::Duration;
///
/// use tradedesk_realtime::feed::Client;
/// use tradedesk_realtime::ws::config::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new(Config::default())?;
///     client.connect().await?;
///
///     let ticker = client.subscribe_ticker("BTCUSDT", |msg| {
///         println!("{}: {}", msg.channel, msg.data);
///     });
///
///     tokio::time::sleep(Duration::from_secs(60)).await;
///     ticker.unsubscribe();
///     client.disconnect();
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Config,
    connection: ConnectionManager<Arc<Router>>,
    router: Arc<Router>,
    registry: Arc<Registry>,
}

impl Client {
    /// Create a client for `config.url`. Nothing connects until [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns a validation error if the URL does not parse or is not `ws`/`wss`,
    /// or if the heartbeat interval is zero.
    pub fn new(config: Config) -> Result<Self> {
        let url = Url::parse(&config.url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "endpoint {} must use the ws or wss scheme",
                config.url
            )));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(Error::validation("heartbeat interval must be greater than zero"));
        }

        let registry = Arc::new(Registry::new());
        let router = Arc::new(Router::new(Arc::clone(&registry)));
        let connection = ConnectionManager::new(config.clone(), Arc::clone(&router));

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                connection,
                router,
                registry,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open the connection, or wait for the attempt already in flight.
    ///
    /// Subscriptions made before connecting are sent once the transport opens.
    ///
    /// # Errors
    ///
    /// Returns a [`WsError::ConnectionFailed`] error if the transport fails
    /// before opening or [`disconnect`](Self::disconnect) cancels the attempt.
    pub async fn connect(&self) -> Result<()> {
        self.inner.connection.connect().await
    }

    /// Close the connection and stop reconnecting until the next [`connect`](Self::connect).
    ///
    /// Subscriptions stay registered and are replayed on the next connect.
    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Number of the reconnection attempt in flight or pending, `0` otherwise.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.connection.reconnect_attempt()
    }

    /// Select a feed. Callbacks are attached with [`Feed::attach`].
    ///
    /// ```rust, no_run
    /// # use tradedesk_realtime::feed::{Channel, Client};
    /// # fn example(client: &Client) {
    /// let feed = client.subscribe(Channel::Kline, Some("BTCUSDT"), Some("1m"));
    /// let chart = feed.attach(|msg| println!("chart: {}", msg.data));
    /// let table = feed.attach(|msg| println!("table: {}", msg.data));
    /// # drop((chart, table));
    /// # }
    /// ```
    #[must_use]
    pub fn subscribe<C: Into<String>>(
        &self,
        channel: C,
        symbol: Option<&str>,
        interval: Option<&str>,
    ) -> Feed {
        Feed {
            client: self.clone(),
            key: SubscriptionKey::new(channel, symbol, interval),
        }
    }

    /// Ticker updates for `symbol`.
    pub fn subscribe_ticker<F>(&self, symbol: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Ticker, Some(symbol), None)
            .attach(callback)
    }

    /// Candles for `symbol` at `interval` (e.g. `1m`, `1h`).
    pub fn subscribe_kline<F>(&self, symbol: &str, interval: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Kline, Some(symbol), Some(interval))
            .attach(callback)
    }

    /// Public trades for `symbol`.
    pub fn subscribe_trade<F>(&self, symbol: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Trade, Some(symbol), None)
            .attach(callback)
    }

    /// Order book updates for `symbol`.
    pub fn subscribe_order_book<F>(&self, symbol: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(Channel::OrderBook, Some(symbol), None)
            .attach(callback)
    }

    /// Account-wide portfolio updates.
    pub fn subscribe_portfolio<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Portfolio, None, None)
            .attach(callback)
    }

    /// Account-wide risk updates.
    pub fn subscribe_risk<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.subscribe(Channel::Risk, None, None).attach(callback)
    }

    /// Observe every parsed message, whatever its channel.
    pub fn on_message<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.inner.router.add_observer(Arc::new(callback));
        let router = Arc::clone(&self.inner.router);
        Unsubscribe::new(move || {
            router.remove_observer(id);
        })
    }

    /// Stream of every parsed message.
    ///
    /// The stream ends with a [`WsError::Lagged`] error if the consumer falls
    /// too far behind.
    pub fn messages(&self) -> impl Stream<Item = Result<InboundMessage>> + use<> {
        let mut rx = self.inner.router.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(msg) => yield msg,
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Message stream lagged, missed {n} messages");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Number of feeds with at least one attached callback.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.subscription_count()
    }

    /// Keys of every feed with at least one attached callback.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<SubscriptionKey> {
        self.inner.registry.active_keys()
    }
}

/// A selected feed, produced by [`Client::subscribe`].
///
/// The wire subscription exists while at least one attached callback does.
#[derive(Clone)]
pub struct Feed {
    client: Client,
    key: SubscriptionKey,
}

impl Feed {
    #[must_use]
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Attach a callback for this feed's messages.
    ///
    /// The first callback on a feed sends the wire subscribe frame; detaching
    /// the last one sends the unsubscribe frame.
    pub fn attach<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let inner = &self.client.inner;
        let callback: Callback = Arc::new(callback);
        let id = inner
            .registry
            .attach(&self.key, callback, &inner.connection);

        let registry = Arc::clone(&inner.registry);
        let connection = inner.connection.clone();
        let composed_key = self.key.to_string();
        Unsubscribe::new(move || {
            registry.detach(&composed_key, id, &connection);
        })
    }
}
