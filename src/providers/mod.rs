// =============================================================================
// Provider Adapters — one per external market data source
// =============================================================================
//
// Every adapter implements the `ProviderAdapter` trait and reports back over
// one shared event channel: normalized candles, connectivity transitions, and
// errors. Nothing here relies on ambient event propagation; the dispatcher
// owns the receiving end and the ProviderManager owns the adapters.
//
// `ProviderCore` carries the bookkeeping each variant needs (connected flag,
// generation counter, error state, subscription tracking, stream tasks). It is
// composed into each adapter, never inherited; aggregation state for
// tick-sourcing variants lives in the variant itself.
// =============================================================================

pub mod binance;
pub mod coinbase;
pub mod manager;
pub mod rate_limit;
pub mod sim;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::types::{Interval, OHLCVCandle, RawCandle};
pub use manager::ProviderManager;
pub use rate_limit::{RateLimitMetadata, RateLimiter};

// =============================================================================
// Events
// =============================================================================

/// Everything an adapter reports to the rest of the pipeline.
#[derive(Debug)]
pub enum ProviderEvent {
    /// A normalized live candle update. `generation` identifies the adapter
    /// incarnation that produced it; stale generations are dropped downstream.
    Candle {
        generation: u64,
        candle: OHLCVCandle,
    },
    /// Emitted exactly once per connect/disconnect transition.
    Connectivity {
        provider: String,
        generation: u64,
        connected: bool,
    },
    /// A runtime error on an open provider; never crashes the pipeline.
    Error {
        provider: String,
        generation: u64,
        message: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<ProviderEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProviderEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// =============================================================================
// ProviderAdapter trait
// =============================================================================

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Establish connectivity. On success the adapter generation is bumped, a
    /// connect event is emitted, and live streams for every tracked
    /// subscription are (re)spawned. On failure the adapter stays
    /// disconnected.
    async fn connect(&self) -> Result<()>;

    /// Tear down live streams and emit a disconnect event (once).
    async fn disconnect(&self);

    /// Start streaming live candles for (symbol, interval). Subscribing twice
    /// is a no-op beyond bookkeeping.
    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()>;

    /// Stop streaming for (symbol, interval). Unsubscribing the last interval
    /// for a symbol drops the symbol's tracking entry entirely.
    async fn unsubscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()>;

    /// Fetch historical candles for the inclusive `[from, to]` ms window.
    /// Implementations throttle through their own rate limiter.
    async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Vec<RawCandle>>;

    fn rate_limit_metadata(&self) -> RateLimitMetadata;
    fn supported_symbols(&self) -> Vec<String>;
    fn supported_intervals(&self) -> Vec<Interval>;
    fn is_connected(&self) -> bool;

    /// Incarnation counter, bumped on every connectivity transition. Used to
    /// fence out results and live updates from a previous incarnation.
    fn generation(&self) -> u64;

    fn tracked_subscriptions(&self) -> Vec<(String, Interval)>;
    fn error_state(&self) -> Option<String>;
}

// =============================================================================
// ProviderCore — shared bookkeeping, composed into each adapter
// =============================================================================

pub struct ProviderCore {
    name: String,
    connected: AtomicBool,
    generation: AtomicU64,
    error: RwLock<Option<String>>,
    events: EventSender,
    subscriptions: RwLock<BTreeMap<String, BTreeSet<Interval>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ProviderCore {
    pub fn new(name: impl Into<String>, events: EventSender) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            error: RwLock::new(None),
            events,
            subscriptions: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Connectivity transitions
    // -------------------------------------------------------------------------

    /// Flip to connected. Emits the connect event and bumps the generation
    /// exactly once per transition; repeated calls while connected are no-ops.
    pub fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *self.error.write() = None;
            let _ = self.events.send(ProviderEvent::Connectivity {
                provider: self.name.clone(),
                generation,
                connected: true,
            });
        }
    }

    /// Flip to disconnected. Emits the disconnect event and bumps the
    /// generation exactly once per transition, immediately fencing out any
    /// in-flight updates from the old incarnation.
    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.events.send(ProviderEvent::Connectivity {
                provider: self.name.clone(),
                generation,
                connected: false,
            });
        }
    }

    /// Emit a normalized live candle stamped with the current generation.
    pub fn emit_candle(&self, candle: OHLCVCandle) {
        let _ = self.events.send(ProviderEvent::Candle {
            generation: self.generation(),
            candle,
        });
    }

    /// Record an error on the adapter state and report it on the channel.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        *self.error.write() = Some(message.clone());
        let _ = self.events.send(ProviderEvent::Error {
            provider: self.name.clone(),
            generation: self.generation(),
            message,
        });
    }

    pub fn error_state(&self) -> Option<String> {
        self.error.read().clone()
    }

    // -------------------------------------------------------------------------
    // Subscription tracking (symbol → interval set)
    // -------------------------------------------------------------------------

    /// Track (symbol, interval). Returns `false` if it was already tracked.
    pub fn track(&self, symbol: &str, interval: Interval) -> bool {
        self.subscriptions
            .write()
            .entry(symbol.to_string())
            .or_default()
            .insert(interval)
    }

    /// Untrack (symbol, interval), removing the symbol entry when its last
    /// interval goes. Returns `false` if it was not tracked.
    pub fn untrack(&self, symbol: &str, interval: Interval) -> bool {
        let mut subs = self.subscriptions.write();
        let Some(intervals) = subs.get_mut(symbol) else {
            return false;
        };
        let removed = intervals.remove(&interval);
        if intervals.is_empty() {
            subs.remove(symbol);
        }
        removed
    }

    /// All intervals tracked for one symbol.
    pub fn tracked_intervals(&self, symbol: &str) -> Vec<Interval> {
        self.subscriptions
            .read()
            .get(symbol)
            .map(|ivs| ivs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every tracked (symbol, interval) pair.
    pub fn tracked(&self) -> Vec<(String, Interval)> {
        self.subscriptions
            .read()
            .iter()
            .flat_map(|(sym, ivs)| ivs.iter().map(move |iv| (sym.clone(), *iv)))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Stream task lifecycle
    // -------------------------------------------------------------------------

    /// Register a stream task under `key`, aborting any task it replaces.
    pub fn insert_task(&self, key: impl Into<String>, handle: JoinHandle<()>) {
        if let Some(old) = self.tasks.lock().insert(key.into(), handle) {
            old.abort();
        }
    }

    /// Abort and forget the stream task under `key`, if any.
    pub fn abort_task(&self, key: &str) {
        if let Some(handle) = self.tasks.lock().remove(key) {
            handle.abort();
            debug!(provider = %self.name, key, "stream task aborted");
        }
    }

    /// Abort every stream task.
    pub fn abort_all_tasks(&self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
    }
}

// =============================================================================
// Shared parsing helper
// =============================================================================

/// Exchanges commonly send numeric values as JSON strings; accept both.
pub(crate) fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> (ProviderCore, EventReceiver) {
        let (tx, rx) = event_channel();
        (ProviderCore::new("test", tx), rx)
    }

    #[test]
    fn connectivity_events_fire_once_per_transition() {
        let (core, mut rx) = core();

        core.mark_connected();
        core.mark_connected(); // no second event
        core.mark_disconnected();
        core.mark_disconnected(); // no second event

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            ProviderEvent::Connectivity {
                connected: true,
                generation: 1,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            ProviderEvent::Connectivity {
                connected: false,
                generation: 2,
                ..
            }
        ));
        assert_eq!(core.generation(), 2);
    }

    #[test]
    fn untracking_last_interval_drops_symbol_entry() {
        let (core, _rx) = core();

        assert!(core.track("BTC/USDT", Interval::M1));
        assert!(core.track("BTC/USDT", Interval::M5));
        assert!(!core.track("BTC/USDT", Interval::M1)); // already tracked

        assert!(core.untrack("BTC/USDT", Interval::M1));
        assert_eq!(core.tracked_intervals("BTC/USDT"), vec![Interval::M5]);

        assert!(core.untrack("BTC/USDT", Interval::M5));
        assert!(core.tracked().is_empty());
        assert!(core.tracked_intervals("BTC/USDT").is_empty());

        // Untracking something unknown is a no-op.
        assert!(!core.untrack("BTC/USDT", Interval::M5));
    }

    #[test]
    fn report_error_sets_state_and_emits() {
        let (core, mut rx) = core();
        core.report_error("stream torn");

        assert_eq!(core.error_state().as_deref(), Some("stream torn"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProviderEvent::Error { .. }
        ));
    }

    #[test]
    fn reconnect_clears_error_state() {
        let (core, _rx) = core();
        core.report_error("boom");
        core.mark_connected();
        assert_eq!(core.error_state(), None);
    }

    #[test]
    fn parse_string_f64_accepts_both_shapes() {
        assert_eq!(
            parse_string_f64(&serde_json::json!("37000.5"), "p").unwrap(),
            37000.5
        );
        assert_eq!(parse_string_f64(&serde_json::json!(12.5), "p").unwrap(), 12.5);
        assert!(parse_string_f64(&serde_json::json!(true), "p").is_err());
        assert!(parse_string_f64(&serde_json::json!("abc"), "p").is_err());
    }
}
