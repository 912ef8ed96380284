#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use futures::future::{FutureExt as _, Shared};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::config::Config;
use super::error::WsError;
use super::traits::{FrameSink, Handler, TransportId};
use crate::Result;
use crate::feed::types::request::ControlFrame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Resolves to `Ok(true)` once the attempt's transport is open. Resolves to
/// `Ok(false)` or `Err` if it failed or was cancelled first.
type AttemptOutcome = Shared<oneshot::Receiver<bool>>;

/// Connection state as observed by callers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected. Also reported while waiting out a reconnect backoff.
    Disconnected,
    /// A transport is being opened
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Short lowercase name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected { .. } => "connected",
        }
    }
}

/// Instruction for the task that owns the open transport.
#[derive(Debug)]
enum Outbound {
    Frame(String),
    Close,
}

/// Where the manager is in its lifecycle.
///
/// Every spawned transport task and backoff timer carries the generation it
/// was created for. Events from a generation that is no longer current are
/// ignored, which is how a manual `disconnect()` suppresses reconnection.
enum Lifecycle {
    /// Never connected, manually disconnected, or out of reconnect attempts.
    Idle,
    Connecting {
        attempt: u32,
        generation: u64,
        task: JoinHandle<()>,
        outcome: AttemptOutcome,
    },
    Open {
        generation: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    /// Waiting for `timer` to start reconnection attempt number `attempt`.
    Backoff {
        attempt: u32,
        generation: u64,
        timer: JoinHandle<()>,
    },
}

impl Lifecycle {
    const fn generation(&self) -> Option<u64> {
        match self {
            Self::Idle => None,
            Self::Connecting { generation, .. }
            | Self::Open { generation, .. }
            | Self::Backoff { generation, .. } => Some(*generation),
        }
    }
}

struct Machine {
    lifecycle: Lifecycle,
    backoff: ExponentialBackoff,
    generation: u64,
}

impl Machine {
    fn next_generation(&mut self) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }
}

struct Inner<H> {
    config: Config,
    handler: H,
    machine: Mutex<Machine>,
    /// Watch channel sender for state changes
    state_tx: watch::Sender<ConnectionState>,
    /// Watch channel receiver for state changes (for use in checking the current state)
    state_rx: watch::Receiver<ConnectionState>,
}

/// Owns the single WebSocket transport, its lifecycle and its reconnection.
///
/// Nothing happens until [`connect`](Self::connect) is called. After that the
/// manager keeps the transport open: an unexpected close schedules a new
/// attempt after `interval * multiplier^(n-1)` for the n-th consecutive
/// attempt, up to `max_attempts`. A successful open resets the count.
/// [`disconnect`](Self::disconnect) stops everything until the next `connect`.
///
/// Transport events are forwarded to the [`Handler`] `H`.
pub struct ConnectionManager<H: Handler> {
    inner: Arc<Inner<H>>,
}

impl<H: Handler> Clone for ConnectionManager<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: Handler> ConnectionManager<H> {
    /// Create an idle connection manager. No task is spawned until `connect`.
    #[must_use]
    pub fn new(config: Config, handler: H) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let backoff = config.reconnect.clone().into();

        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                machine: Mutex::new(Machine {
                    lifecycle: Lifecycle::Idle,
                    backoff,
                    generation: 0,
                }),
                state_tx,
                state_rx,
            }),
        }
    }

    /// Open the transport, or join the attempt already in flight.
    ///
    /// Resolves immediately when already connected. Calling this while a
    /// reconnect is waiting out its backoff starts the attempt right away.
    ///
    /// # Errors
    ///
    /// Returns [`WsError::ConnectionFailed`] if the transport fails before it
    /// opens or the attempt is cancelled by [`disconnect`](Self::disconnect).
    pub async fn connect(&self) -> Result<()> {
        let outcome = {
            let mut guard = self.lock();
            let machine = &mut *guard;
            match &machine.lifecycle {
                Lifecycle::Open { .. } => return Ok(()),
                Lifecycle::Connecting { outcome, .. } => outcome.clone(),
                Lifecycle::Backoff { attempt, timer, .. } => {
                    timer.abort();
                    let attempt = *attempt;
                    self.start_attempt(machine, attempt)
                }
                Lifecycle::Idle => {
                    machine.backoff.reset();
                    self.start_attempt(machine, 0)
                }
            }
        };

        match outcome.await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(WsError::ConnectionFailed.into()),
        }
    }

    /// Close the transport and cancel any pending or in-flight reconnection.
    ///
    /// Idempotent. No reconnection happens until the next [`connect`](Self::connect).
    pub fn disconnect(&self) {
        let mut machine = self.lock();
        match mem::replace(&mut machine.lifecycle, Lifecycle::Idle) {
            Lifecycle::Idle => {}
            Lifecycle::Connecting { task, .. } => task.abort(),
            Lifecycle::Open { outbound, .. } => {
                _ = outbound.send(Outbound::Close);
            }
            Lifecycle::Backoff { timer, .. } => timer.abort(),
        }
        self.set_state(ConnectionState::Disconnected);

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.inner.config.url, "Disconnected by request");
    }

    /// Whether the transport is fully open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Number of the reconnection attempt in flight or pending, `0` otherwise.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        match &self.lock().lifecycle {
            Lifecycle::Connecting { attempt, .. } | Lifecycle::Backoff { attempt, .. } => *attempt,
            Lifecycle::Idle | Lifecycle::Open { .. } => 0,
        }
    }

    /// The handler receiving this connection's events.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.inner.handler
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        // The machine is only mutated through whole-variant replacements, so a
        // poisoned lock still holds a consistent value.
        self.inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    /// Spawn a transport task and move to `Connecting`.
    fn start_attempt(&self, machine: &mut Machine, attempt: u32) -> AttemptOutcome {
        let generation = machine.next_generation();
        let (opened_tx, opened_rx) = oneshot::channel();
        let outcome = opened_rx.shared();

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run(generation, opened_tx).await;
        });

        machine.lifecycle = Lifecycle::Connecting {
            attempt,
            generation,
            task,
            outcome: outcome.clone(),
        };
        self.set_state(ConnectionState::Connecting);

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.inner.config.url, attempt, "Connecting");

        outcome
    }

    /// Body of one transport task, from dialing to close.
    async fn run(self, generation: u64, opened: oneshot::Sender<bool>) {
        let ws_stream = match connect_async(self.inner.config.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %self.inner.config.url, error = %e, "Unable to connect");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;

                // Settle the lifecycle before waking callers of `connect`
                self.on_closed(generation);
                _ = opened.send(false);
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if !self.on_opened(generation, outbound_tx) {
            return;
        }

        // Replays subscriptions before anyone awaiting `connect` resumes. Feeds
        // attached since `on_opened` have already subscribed on this transport.
        self.inner.handler.on_open(&self);
        _ = opened.send(true);

        if let Err(e) = self.handle_connection(ws_stream, outbound_rx).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(endpoint = %self.inner.config.url, error = %e, "Connection lost");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.on_closed(generation);
    }

    /// Record a successful open. Returns `false` if the attempt was superseded.
    fn on_opened(&self, generation: u64, outbound: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut machine = self.lock();
        if !matches!(
            machine.lifecycle,
            Lifecycle::Connecting { generation: current, .. } if current == generation
        ) {
            return false;
        }

        machine.lifecycle = Lifecycle::Open {
            generation,
            outbound,
        };
        machine.backoff.reset();
        self.set_state(ConnectionState::Connected {
            since: Instant::now(),
        });

        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.inner.config.url, "Connected");

        true
    }

    /// Record the end of a transport and schedule a reconnect if allowed.
    fn on_closed(&self, generation: u64) {
        let mut guard = self.lock();
        let machine = &mut *guard;
        if machine.lifecycle.generation() != Some(generation) {
            // Manual disconnect or a newer attempt owns the lifecycle
            return;
        }

        let attempt = match &machine.lifecycle {
            Lifecycle::Connecting { attempt, .. } => *attempt,
            _ => 0,
        };
        machine.lifecycle = Lifecycle::Idle;
        self.set_state(ConnectionState::Disconnected);

        let reconnect = &self.inner.config.reconnect;
        if !reconnect.enabled {
            return;
        }
        if attempt >= reconnect.max_attempts {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                endpoint = %self.inner.config.url,
                attempts = attempt,
                "Reconnect attempts exhausted, staying disconnected"
            );
            return;
        }

        let next_attempt = attempt + 1;
        let delay = machine
            .backoff
            .next_backoff()
            .unwrap_or(reconnect.max_backoff);
        let generation = machine.next_generation();

        let this = self.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            this.on_backoff_elapsed(generation);
        });
        machine.lifecycle = Lifecycle::Backoff {
            attempt: next_attempt,
            generation,
            timer,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            endpoint = %self.inner.config.url,
            attempt = next_attempt,
            delay_ms = delay.as_millis(),
            "Scheduled reconnect"
        );
    }

    fn on_backoff_elapsed(&self, generation: u64) {
        let mut guard = self.lock();
        let machine = &mut *guard;
        if let Lifecycle::Backoff {
            attempt,
            generation: current,
            ..
        } = machine.lifecycle
            && current == generation
        {
            // The outcome is only awaited by callers joining through `connect`
            drop(self.start_attempt(machine, attempt));
        }
    }

    /// Pump an open transport until it closes.
    async fn handle_connection(
        &self,
        ws_stream: WsStream,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();

        // Channel to notify heartbeat loop when PONG is received
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

        let every = self.inner.config.heartbeat_interval;
        let within = self.inner.config.heartbeat_timeout;
        let mut heartbeat = tokio::spawn(async move {
            Self::heartbeat_loop(ping_tx, pong_rx, every, within).await;
        });

        let result = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");

                            self.inner.handler.on_frame(text.as_str());
                        }
                        Some(Ok(Message::Pong(_))) => {
                            _ = pong_tx.send(Instant::now());
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break Err(WsError::ConnectionClosed);
                        }
                        Some(Err(e)) => {
                            break Err(WsError::Connection(e));
                        }
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; PINGs are answered by tungstenite.
                        }
                    }
                }

                Some(outbound) = outbound_rx.recv() => {
                    match outbound {
                        Outbound::Frame(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                break Err(WsError::Connection(e));
                            }
                        }
                        Outbound::Close => {
                            _ = write.send(Message::Close(None)).await;
                            break Ok(());
                        }
                    }
                }

                Some(()) = ping_rx.recv() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        break Err(WsError::Connection(e));
                    }
                }

                _ = &mut heartbeat => {
                    break Err(WsError::Timeout);
                }
            }
        };

        heartbeat.abort();

        result.map_err(Into::into)
    }

    /// Sends PING requests and returns once a PONG fails to arrive in time.
    async fn heartbeat_loop(
        ping_tx: mpsc::UnboundedSender<()>,
        mut pong_rx: watch::Receiver<Instant>,
        every: Duration,
        within: Duration,
    ) {
        let mut ping_interval = interval(every);
        // The first tick completes immediately
        ping_interval.tick().await;

        loop {
            ping_interval.tick().await;

            // Mark current PONG state as seen before sending PING
            drop(pong_rx.borrow_and_update());

            if ping_tx.send(()).is_err() {
                return;
            }

            match timeout(within, pong_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return,
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Heartbeat timeout: no PONG received within {within:?}");
                    return;
                }
            }
        }
    }
}

impl<H: Handler> FrameSink for ConnectionManager<H> {
    fn send(&self, frame: &ControlFrame) -> Option<TransportId> {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Unable to serialize control frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return None;
            }
        };

        match &self.lock().lifecycle {
            Lifecycle::Open {
                generation,
                outbound,
            } => outbound
                .send(Outbound::Frame(text))
                .is_ok()
                .then_some(*generation),
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%text, "Not connected, dropping control frame");
                None
            }
        }
    }

    fn transport(&self) -> Option<TransportId> {
        match &self.lock().lifecycle {
            Lifecycle::Open { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}
