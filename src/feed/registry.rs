use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{DashMap, Entry};

use super::types::request::{ControlFrame, Operation, SubscriptionKey};
use super::types::response::InboundMessage;
use crate::ws::{FrameSink, TransportId};

/// Consumer-supplied message handler.
pub type Callback = Arc<dyn Fn(&InboundMessage) + Send + Sync + 'static>;

/// Identifies one attached callback.
pub type CallbackId = u64;

/// Callbacks interested in one feed.
struct FeedEntry {
    key: SubscriptionKey,
    /// Ordered by id, so delivery follows attach order
    callbacks: BTreeMap<CallbackId, Callback>,
    /// Transport the last subscribe frame was queued on
    subscribed_on: Option<TransportId>,
}

/// Tracks which callbacks are interested in which feeds.
///
/// A feed is present exactly while it has at least one callback. The wire
/// subscribe frame goes out when a feed's first callback attaches and the
/// unsubscribe frame when its last callback detaches, so any number of
/// consumers of one feed share a single server-side subscription.
#[derive(Default)]
pub struct Registry {
    /// Keyed by the composed subscription key
    feeds: DashMap<String, FeedEntry>,
    next_id: AtomicU64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `callback` to the feed `key`, subscribing on the wire if the feed is new.
    pub fn attach(
        &self,
        key: &SubscriptionKey,
        callback: Callback,
        sink: &dyn FrameSink,
    ) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // The frame is sent while the entry is held so a concurrent detach of
        // the same feed cannot interleave its unsubscribe with our subscribe
        match self.feeds.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().callbacks.insert(id, callback);
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %entry.key(), "Feed already subscribed, multiplexing");
            }
            Entry::Vacant(entry) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %entry.key(), "Subscribing to feed");

                let subscribed_on = sink.send(&ControlFrame::new(Operation::Subscribe, key));
                entry.insert(FeedEntry {
                    key: key.clone(),
                    callbacks: BTreeMap::from([(id, callback)]),
                    subscribed_on,
                });
            }
        }

        id
    }

    /// Detach one callback. Unsubscribes on the wire if it was the feed's last.
    ///
    /// Returns `false` if the callback was not attached.
    pub fn detach(&self, composed_key: &str, id: CallbackId, sink: &dyn FrameSink) -> bool {
        let Entry::Occupied(mut entry) = self.feeds.entry(composed_key.to_owned()) else {
            return false;
        };

        let removed = entry.get_mut().callbacks.remove(&id).is_some();
        if entry.get().callbacks.is_empty() {
            #[cfg(feature = "tracing")]
            tracing::debug!(key = %composed_key, "Unsubscribing from feed");

            let (_, feed) = entry.remove_entry();
            sink.send(&ControlFrame::new(Operation::Unsubscribe, &feed.key));
        }

        removed
    }

    /// Callbacks attached to the feed with this composed key, in attach order.
    #[must_use]
    pub fn callbacks(&self, composed_key: &str) -> Vec<Callback> {
        self.feeds
            .get(composed_key)
            .map(|feed| feed.callbacks.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Re-send a subscribe frame for every feed not yet subscribed on the sink's
    /// current transport.
    ///
    /// A feed first attached after the transport opened has already sent its
    /// own subscribe frame there and is skipped.
    pub fn resubscribe_all(&self, sink: &dyn FrameSink) {
        #[cfg(feature = "tracing")]
        tracing::debug!(count = self.feeds.len(), "Re-subscribing to feeds");

        let current = sink.transport();
        for mut feed in self.feeds.iter_mut() {
            if current.is_some() && feed.subscribed_on == current {
                continue;
            }
            feed.subscribed_on = sink.send(&ControlFrame::new(Operation::Subscribe, &feed.key));
        }
    }

    /// Number of feeds with at least one callback.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.feeds.len()
    }

    /// Number of callbacks attached to the feed with this composed key.
    #[must_use]
    pub fn callback_count(&self, composed_key: &str) -> usize {
        self.feeds
            .get(composed_key)
            .map_or(0, |feed| feed.callbacks.len())
    }

    /// Keys of every active feed.
    #[must_use]
    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        self.feeds.iter().map(|feed| feed.key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::feed::types::request::Channel;

    /// Records every frame it is handed, as if written to an always-open transport.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<ControlFrame>>,
        transport: AtomicU64,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<ControlFrame> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }

        /// Simulate the transport closing and a new one opening.
        fn reopen(&self) {
            self.transport.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FrameSink for RecordingSink {
        fn send(&self, frame: &ControlFrame) -> Option<TransportId> {
            self.frames.lock().unwrap().push(frame.clone());
            self.transport()
        }

        fn transport(&self) -> Option<TransportId> {
            Some(self.transport.load(Ordering::SeqCst))
        }
    }

    /// Drops every frame, like a connection that is not open.
    struct ClosedSink;

    impl FrameSink for ClosedSink {
        fn send(&self, _frame: &ControlFrame) -> Option<TransportId> {
            None
        }

        fn transport(&self) -> Option<TransportId> {
            None
        }
    }

    fn noop() -> Callback {
        Arc::new(|_: &InboundMessage| {})
    }

    #[test]
    fn first_attach_subscribes_once() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        let key = SubscriptionKey::new(Channel::Ticker, Some("BTCUSDT"), None);

        registry.attach(&key, noop(), &sink);
        registry.attach(&key, noop(), &sink);
        registry.attach(&key, noop(), &sink);

        assert_eq!(
            sink.take(),
            vec![ControlFrame::subscribe(Channel::Ticker, Some("BTCUSDT"), None)]
        );
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(registry.callback_count("ticker:BTCUSDT"), 3);
    }

    #[test]
    fn last_detach_unsubscribes_once() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        let key = SubscriptionKey::new(Channel::Trade, Some("ETHUSDT"), None);

        let first = registry.attach(&key, noop(), &sink);
        let second = registry.attach(&key, noop(), &sink);
        sink.take();

        assert!(registry.detach("trade:ETHUSDT", first, &sink));
        assert!(sink.take().is_empty());
        assert_eq!(registry.subscription_count(), 1);

        assert!(registry.detach("trade:ETHUSDT", second, &sink));
        assert_eq!(
            sink.take(),
            vec![ControlFrame::unsubscribe(Channel::Trade, Some("ETHUSDT"), None)]
        );
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn detach_twice_is_noop() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        let key = SubscriptionKey::new(Channel::Risk, None, None);

        let id = registry.attach(&key, noop(), &sink);
        assert!(registry.detach("risk", id, &sink));
        assert!(!registry.detach("risk", id, &sink));

        let frames = sink.take();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].operation, Operation::Unsubscribe);
    }

    #[test]
    fn resubscribe_after_full_unsubscribe_sends_again() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        let key = SubscriptionKey::new(Channel::Ticker, Some("BTCUSDT"), None);

        let id = registry.attach(&key, noop(), &sink);
        registry.detach("ticker:BTCUSDT", id, &sink);
        registry.attach(&key, noop(), &sink);

        let operations: Vec<Operation> = sink.take().iter().map(|f| f.operation).collect();
        assert_eq!(
            operations,
            vec![
                Operation::Subscribe,
                Operation::Unsubscribe,
                Operation::Subscribe
            ]
        );
    }

    #[test]
    fn intervals_are_independent_feeds() {
        let registry = Registry::new();
        let sink = RecordingSink::default();

        registry.attach(
            &SubscriptionKey::new(Channel::Kline, Some("BTCUSDT"), Some("1m")),
            noop(),
            &sink,
        );
        registry.attach(
            &SubscriptionKey::new(Channel::Kline, Some("BTCUSDT"), Some("5m")),
            noop(),
            &sink,
        );

        let frames = sink.take();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].interval.as_deref(), Some("1m"));
        assert_eq!(frames[1].interval.as_deref(), Some("5m"));
        assert_eq!(registry.callback_count("kline:BTCUSDT:1m"), 1);
        assert_eq!(registry.callback_count("kline:BTCUSDT:5m"), 1);
    }

    #[test]
    fn resubscribe_all_replays_every_feed() {
        let registry = Registry::new();
        let sink = RecordingSink::default();

        registry.attach(
            &SubscriptionKey::new(Channel::Ticker, Some("BTCUSDT"), None),
            noop(),
            &sink,
        );
        registry.attach(
            &SubscriptionKey::new(Channel::Ticker, Some("BTCUSDT"), None),
            noop(),
            &sink,
        );
        registry.attach(
            &SubscriptionKey::new(Channel::Portfolio, None, None),
            noop(),
            &sink,
        );
        sink.take();

        sink.reopen();
        registry.resubscribe_all(&sink);

        let mut channels: Vec<String> = sink
            .take()
            .into_iter()
            .map(|f| {
                assert_eq!(f.operation, Operation::Subscribe);
                f.channel
            })
            .collect();
        channels.sort();
        assert_eq!(channels, vec!["portfolio", "ticker"]);
    }

    #[test]
    fn callbacks_follow_attach_order() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        let key = SubscriptionKey::new(Channel::Ticker, Some("BTCUSDT"), None);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            registry.attach(
                &key,
                Arc::new(move |_: &InboundMessage| seen.lock().unwrap().push(label)),
                &sink,
            );
        }

        let message: InboundMessage = serde_json::from_str(
            r#"{"type":"ticker","channel":"ticker:BTCUSDT","data":{},"timestamp":0}"#,
        )
        .unwrap();
        for callback in registry.callbacks("ticker:BTCUSDT") {
            callback(&message);
        }

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(registry.callbacks("ticker:ETHUSDT").is_empty());
    }

    #[test]
    fn replay_skips_feeds_already_subscribed_on_open_transport() {
        let registry = Registry::new();
        let sink = RecordingSink::default();

        // Attached while disconnected: only the replay can subscribe it
        registry.attach(
            &SubscriptionKey::new(Channel::Portfolio, None, None),
            noop(),
            &ClosedSink,
        );
        // Attached on the new transport before its replay ran
        registry.attach(
            &SubscriptionKey::new(Channel::Ticker, Some("BTCUSDT"), None),
            noop(),
            &sink,
        );
        sink.take();

        registry.resubscribe_all(&sink);

        assert_eq!(
            sink.take(),
            vec![ControlFrame::subscribe(Channel::Portfolio, None, None)]
        );

        registry.resubscribe_all(&sink);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn replay_on_closed_sink_is_retried_on_next_transport() {
        let registry = Registry::new();
        let sink = RecordingSink::default();
        registry.attach(
            &SubscriptionKey::new(Channel::Risk, None, None),
            noop(),
            &ClosedSink,
        );

        registry.resubscribe_all(&ClosedSink);
        registry.resubscribe_all(&sink);

        assert_eq!(
            sink.take(),
            vec![ControlFrame::subscribe(Channel::Risk, None, None)]
        );
    }
}
