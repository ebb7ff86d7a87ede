// =============================================================================
// Subscription Registry — connection ↔ subscription-key bookkeeping
// =============================================================================
//
// Two inverse mappings (connection → keys, key → connections) for each of the
// candle and signal key spaces. Both directions mutate behind one RwLock so
// they are mutually consistent at every observable point; every mutation goes
// through `mutate_key`, the single code path that touches both maps.
//
// The registry owns delivery handles (one unbounded sender per connection),
// never the underlying WebSocket transport: connection close is signaled
// externally via `remove_connection`.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::types::{Interval, OHLCVCandle, Signal};

pub type ConnectionId = Uuid;

/// Candle subscription key: `symbol:interval`, exact string equality.
pub fn candle_key(symbol: &str, interval: Interval) -> String {
    format!("{symbol}:{interval}")
}

/// Signal subscription key: `symbol:interval:strategy_id`.
pub fn signal_key(symbol: &str, interval: Interval, strategy_id: &str) -> String {
    format!("{symbol}:{interval}:{strategy_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySpace {
    Candle,
    Signal,
}

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<String>,
    candle_keys: HashSet<String>,
    signal_keys: HashSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    candle_index: HashMap<String, HashSet<ConnectionId>>,
    signal_index: HashMap<String, HashSet<ConnectionId>>,
}

pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Register a new connection with empty tracking sets for both key spaces.
    /// `tx` is the delivery handle updates are pushed through.
    pub fn add_connection(&self, tx: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.write();
        inner.connections.insert(
            id,
            ConnectionEntry {
                tx,
                candle_keys: HashSet::new(),
                signal_keys: HashSet::new(),
            },
        );
        debug!(connection = %id, total = inner.connections.len(), "connection registered");
        id
    }

    /// Remove a connection and every reference to it in both mapping
    /// directions; keys whose subscriber set becomes empty are dropped.
    pub fn remove_connection(&self, id: ConnectionId) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.connections.remove(&id) else {
            return;
        };
        for key in &entry.candle_keys {
            if let Some(subscribers) = inner.candle_index.get_mut(key) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    inner.candle_index.remove(key);
                }
            }
        }
        for key in &entry.signal_keys {
            if let Some(subscribers) = inner.signal_index.get_mut(key) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    inner.signal_index.remove(key);
                }
            }
        }
        debug!(connection = %id, total = inner.connections.len(), "connection removed");
    }

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Subscribe a connection to a candle key. Subscribing twice is a no-op.
    /// Returns `false` when the connection is unknown.
    pub fn subscribe_candles(&self, id: ConnectionId, key: &str) -> bool {
        self.mutate_key(id, key, KeySpace::Candle, true)
    }

    /// Unsubscribe a connection from a candle key. Unknown subscriptions are
    /// a no-op.
    pub fn unsubscribe_candles(&self, id: ConnectionId, key: &str) -> bool {
        self.mutate_key(id, key, KeySpace::Candle, false)
    }

    pub fn subscribe_signals(&self, id: ConnectionId, key: &str) -> bool {
        self.mutate_key(id, key, KeySpace::Signal, true)
    }

    pub fn unsubscribe_signals(&self, id: ConnectionId, key: &str) -> bool {
        self.mutate_key(id, key, KeySpace::Signal, false)
    }

    /// The one code path that updates a connection's key set and the inverse
    /// index together.
    fn mutate_key(&self, id: ConnectionId, key: &str, space: KeySpace, add: bool) -> bool {
        let mut inner = self.inner.write();
        let RegistryInner {
            connections,
            candle_index,
            signal_index,
        } = &mut *inner;

        let Some(entry) = connections.get_mut(&id) else {
            warn!(connection = %id, key, "subscription change for unknown connection");
            return false;
        };
        let (keys, index) = match space {
            KeySpace::Candle => (&mut entry.candle_keys, candle_index),
            KeySpace::Signal => (&mut entry.signal_keys, signal_index),
        };

        if add {
            keys.insert(key.to_string());
            index.entry(key.to_string()).or_default().insert(id);
        } else {
            keys.remove(key);
            if let Some(subscribers) = index.get_mut(key) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    index.remove(key);
                }
            }
        }
        trace!(connection = %id, key, add, "subscription updated");
        true
    }

    // -------------------------------------------------------------------------
    // Fan-out
    // -------------------------------------------------------------------------

    /// Delivery handles for every subscriber of a candle key. Empty when
    /// nobody is subscribed, never an error.
    pub fn candle_subscribers(&self, key: &str) -> Vec<mpsc::UnboundedSender<String>> {
        let inner = self.inner.read();
        inner
            .candle_index
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).map(|e| e.tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn signal_subscribers(&self, key: &str) -> Vec<mpsc::UnboundedSender<String>> {
        let inner = self.inner.read();
        inner
            .signal_index
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.connections.get(id).map(|e| e.tx.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Serialize a candle update once and push it to every subscriber of its
    /// `symbol:interval` key. Returns the number of deliveries attempted.
    pub fn publish_candle(&self, candle: &OHLCVCandle) -> usize {
        let key = candle_key(&candle.symbol, candle.interval);
        let subscribers = self.candle_subscribers(&key);
        if subscribers.is_empty() {
            return 0;
        }

        let payload = match serde_json::to_string(&serde_json::json!({
            "type": "candle_update",
            "data": candle,
        })) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize candle update");
                return 0;
            }
        };

        deliver(&subscribers, &key, payload)
    }

    /// Push a signal update to every subscriber of its
    /// `symbol:interval:strategy_id` key.
    pub fn publish_signal(&self, signal: &Signal) -> usize {
        let key = signal_key(&signal.symbol, signal.interval, &signal.strategy_id);
        let subscribers = self.signal_subscribers(&key);
        if subscribers.is_empty() {
            return 0;
        }

        let payload = match serde_json::to_string(&serde_json::json!({
            "type": "signal_update",
            "data": signal,
        })) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize signal update");
                return 0;
            }
        };

        deliver(&subscribers, &key, payload)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn connection_count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Total number of (connection, key) subscription edges in both spaces.
    pub fn subscription_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .connections
            .values()
            .map(|e| e.candle_keys.len() + e.signal_keys.len())
            .sum()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking delivery attempt per subscriber. A send failure only means
/// the connection task already went away; its cleanup removes the entry.
fn deliver(subscribers: &[mpsc::UnboundedSender<String>], key: &str, payload: String) -> usize {
    let mut delivered = 0;
    for tx in subscribers {
        if tx.send(payload.clone()).is_ok() {
            delivered += 1;
        } else {
            debug!(key, "dropping update for closed connection");
        }
    }
    delivered
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalAction;

    fn sample_candle(symbol: &str, interval: Interval) -> OHLCVCandle {
        OHLCVCandle {
            symbol: symbol.into(),
            interval,
            timestamp: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            provider: "sim".into(),
        }
    }

    #[test]
    fn fan_out_reaches_exactly_the_matching_key() {
        let registry = SubscriptionRegistry::new();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.add_connection(tx_a);
        let _b = registry.add_connection(tx_b);

        registry.subscribe_candles(a, &candle_key("BTC/USDT", Interval::M1));

        let delivered = registry.publish_candle(&sample_candle("BTC/USDT", Interval::M1));
        assert_eq!(delivered, 1);
        let msg = rx_a.try_recv().unwrap();
        assert!(msg.contains("candle_update"));
        assert!(msg.contains("BTC/USDT"));

        // The unsubscribed connection saw nothing.
        assert!(rx_b.try_recv().is_err());

        // A different interval is a different key.
        let delivered = registry.publish_candle(&sample_candle("BTC/USDT", Interval::M5));
        assert_eq!(delivered, 0);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.add_connection(tx);
        let key = candle_key("BTC/USDT", Interval::M1);

        registry.subscribe_candles(id, &key);
        registry.subscribe_candles(id, &key);
        assert_eq!(registry.subscription_count(), 1);

        // One subscription, one delivery.
        let delivered = registry.publish_candle(&sample_candle("BTC/USDT", Interval::M1));
        assert_eq!(delivered, 1);
        rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_unknown_key_is_a_noop() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.add_connection(tx);

        assert!(registry.unsubscribe_candles(id, "BTC/USDT:1m"));
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn remove_connection_leaves_no_residue() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = registry.add_connection(tx);

        registry.subscribe_candles(id, &candle_key("BTC/USDT", Interval::M1));
        registry.subscribe_candles(id, &candle_key("ETH/USDT", Interval::M5));
        registry.subscribe_signals(id, &signal_key("BTC/USDT", Interval::M1, "ema-cross"));

        registry.remove_connection(id);

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.subscription_count(), 0);
        assert!(registry
            .candle_subscribers(&candle_key("BTC/USDT", Interval::M1))
            .is_empty());
        assert!(registry
            .signal_subscribers(&signal_key("BTC/USDT", Interval::M1, "ema-cross"))
            .is_empty());

        // Late mutations for the removed connection are rejected quietly.
        assert!(!registry.subscribe_candles(id, "BTC/USDT:1m"));
    }

    #[test]
    fn key_sharing_connections_all_receive() {
        let registry = SubscriptionRegistry::new();
        let key = candle_key("BTC/USDT", Interval::M1);

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = registry.add_connection(tx_a);
        let b = registry.add_connection(tx_b);
        registry.subscribe_candles(a, &key);
        registry.subscribe_candles(b, &key);

        let delivered = registry.publish_candle(&sample_candle("BTC/USDT", Interval::M1));
        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        // Removing one connection keeps the other subscribed.
        registry.remove_connection(a);
        let delivered = registry.publish_candle(&sample_candle("BTC/USDT", Interval::M1));
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn signal_fan_out_uses_strategy_scoped_key() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.add_connection(tx);
        registry.subscribe_signals(id, &signal_key("BTC/USDT", Interval::M1, "ema-cross"));

        let mut signal = Signal {
            symbol: "BTC/USDT".into(),
            interval: Interval::M1,
            timestamp: 0,
            action: SignalAction::Buy,
            confidence: 0.9,
            strategy_id: "ema-cross".into(),
            metadata: None,
        };
        assert_eq!(registry.publish_signal(&signal), 1);
        assert!(rx.try_recv().unwrap().contains("signal_update"));

        // Same series, different strategy: different key.
        signal.strategy_id = "rsi".into();
        assert_eq!(registry.publish_signal(&signal), 0);
    }

    #[test]
    fn keys_are_case_sensitive() {
        let registry = SubscriptionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.add_connection(tx);
        registry.subscribe_candles(id, &candle_key("btc/usdt", Interval::M1));

        assert_eq!(
            registry.publish_candle(&sample_candle("BTC/USDT", Interval::M1)),
            0
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn delivery_to_dropped_receiver_is_not_counted() {
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.add_connection(tx);
        registry.subscribe_candles(id, &candle_key("BTC/USDT", Interval::M1));
        drop(rx);

        assert_eq!(
            registry.publish_candle(&sample_candle("BTC/USDT", Interval::M1)),
            0
        );
    }
}
