// =============================================================================
// Simulated Adapter — deterministic random-walk tick source
// =============================================================================
//
// Produces a seeded random-walk tick stream per subscribed symbol and routes
// it through a private CandleAggregator, exercising the exact same path a
// real tick-feed provider uses — without any network. Historical candles are
// derived deterministically from (symbol, window_start), so repeated
// backfills regenerate identical rows and the idempotent store absorbs them.
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::aggregator::CandleAggregator;
use crate::providers::{ProviderAdapter, ProviderCore, RateLimitMetadata, RateLimiter};
use crate::types::{Interval, RawCandle, Tick};

pub const PROVIDER_NAME: &str = "sim";

/// Cadence of generated ticks.
const TICK_PERIOD_MS: u64 = 250;

const DEFAULT_SYMBOLS: &[&str] = &["SIM/USD", "BTC/USDT", "ETH/USDT"];

pub struct SimAdapter {
    core: Arc<ProviderCore>,
    limiter: RateLimiter,
    aggregator: Arc<Mutex<CandleAggregator>>,
}

impl SimAdapter {
    pub fn new(events: crate::providers::EventSender) -> Self {
        Self {
            core: Arc::new(ProviderCore::new(PROVIDER_NAME, events)),
            limiter: RateLimiter::new(RateLimitMetadata::default()),
            aggregator: Arc::new(Mutex::new(CandleAggregator::new(PROVIDER_NAME))),
        }
    }

    fn symbol_seed(symbol: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        hasher.finish()
    }

    /// Base price derived from the symbol so different series walk at
    /// different levels.
    fn base_price(symbol: &str) -> f64 {
        100.0 + (Self::symbol_seed(symbol) % 90_000) as f64 / 10.0
    }

    fn spawn_tick_stream(&self, symbol: &str) {
        let core = self.core.clone();
        let aggregator = self.aggregator.clone();
        let canonical = symbol.to_string();
        let handle = tokio::spawn(run_tick_stream(core, aggregator, canonical.clone()));
        self.core.insert_task(canonical, handle);
    }
}

#[async_trait]
impl ProviderAdapter for SimAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn connect(&self) -> Result<()> {
        self.core.abort_all_tasks();
        self.core.mark_connected();
        info!("sim provider connected");

        let mut symbols: Vec<String> = self
            .core
            .tracked()
            .into_iter()
            .map(|(symbol, _)| symbol)
            .collect();
        symbols.dedup();
        for symbol in symbols {
            self.spawn_tick_stream(&symbol);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.core.abort_all_tasks();
        self.core.mark_disconnected();
        info!("sim provider disconnected");
    }

    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()> {
        let first_for_symbol = self.core.tracked_intervals(symbol).is_empty();
        if !self.core.track(symbol, interval) {
            return Ok(());
        }
        if first_for_symbol && self.core.is_connected() {
            self.spawn_tick_stream(symbol);
        }
        debug!(symbol, interval = %interval, "sim subscription added");
        Ok(())
    }

    async fn unsubscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()> {
        if !self.core.untrack(symbol, interval) {
            return Ok(());
        }
        if self.core.tracked_intervals(symbol).is_empty() {
            self.core.abort_task(symbol);
        }
        debug!(symbol, interval = %interval, "sim subscription removed");
        Ok(())
    }

    /// Deterministic synthetic history: one candle per window in `[from, to]`,
    /// seeded from (symbol, window_start).
    async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Vec<RawCandle>> {
        self.limiter.throttle().await;

        let step = interval.duration_ms();
        let mut window = interval.window_start(from);
        if window < from {
            window += step;
        }

        let base = Self::base_price(symbol);
        let mut out = Vec::new();
        while window <= to {
            let mut rng = StdRng::seed_from_u64(Self::symbol_seed(symbol) ^ window as u64);
            let open = base * (1.0 + rng.random_range(-0.01..0.01));
            let close = open * (1.0 + rng.random_range(-0.005..0.005));
            let high = open.max(close) * (1.0 + rng.random_range(0.0..0.003));
            let low = open.min(close) * (1.0 - rng.random_range(0.0..0.003));
            let volume = rng.random_range(1.0..500.0);

            out.push(RawCandle {
                symbol: symbol.to_string(),
                interval,
                timestamp: window,
                open,
                high,
                low,
                close,
                volume,
                provider: Some(PROVIDER_NAME.to_string()),
                extra: serde_json::Map::new(),
            });
            window += step;
        }

        debug!(symbol, interval = %interval, count = out.len(), "sim history generated");
        Ok(out)
    }

    fn rate_limit_metadata(&self) -> RateLimitMetadata {
        self.limiter.metadata()
    }

    fn supported_symbols(&self) -> Vec<String> {
        DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()
    }

    fn supported_intervals(&self) -> Vec<Interval> {
        Interval::ALL.to_vec()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn generation(&self) -> u64 {
        self.core.generation()
    }

    fn tracked_subscriptions(&self) -> Vec<(String, Interval)> {
        self.core.tracked()
    }

    fn error_state(&self) -> Option<String> {
        self.core.error_state()
    }
}

// =============================================================================
// Tick generator task
// =============================================================================

/// Emit a random-walk tick for `symbol` every [`TICK_PERIOD_MS`], folded
/// through the aggregator into every tracked interval.
async fn run_tick_stream(
    core: Arc<ProviderCore>,
    aggregator: Arc<Mutex<CandleAggregator>>,
    symbol: String,
) {
    let mut rng = StdRng::seed_from_u64(SimAdapter::symbol_seed(&symbol));
    let mut price = SimAdapter::base_price(&symbol);
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(TICK_PERIOD_MS));

    info!(symbol = %symbol, start_price = price, "sim tick stream running");
    loop {
        ticker.tick().await;

        price *= 1.0 + rng.random_range(-0.0005..0.0005);
        let tick = Tick {
            price,
            size: rng.random_range(0.01..2.0),
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        let intervals = core.tracked_intervals(&symbol);
        let mut agg = aggregator.lock();
        for interval in intervals {
            let candle = agg.apply_tick(&symbol, interval, &tick);
            core.emit_candle(candle);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::event_channel;
    use crate::types::normalize_candle;

    fn adapter() -> SimAdapter {
        let (tx, _rx) = event_channel();
        SimAdapter::new(tx)
    }

    #[tokio::test]
    async fn history_is_aligned_bounded_and_valid() {
        let sim = adapter();
        let step = Interval::M1.duration_ms();
        let from = step * 10 + 30_000; // deliberately unaligned
        let to = step * 15;

        let raw = sim
            .get_historical_candles("SIM/USD", Interval::M1, from, to)
            .await
            .unwrap();

        // Windows 11..=15 fall inside [from, to].
        assert_eq!(raw.len(), 5);
        for rc in &raw {
            assert_eq!(rc.timestamp % step, 0);
            assert!(rc.timestamp >= from && rc.timestamp <= to);
            let candle = normalize_candle(rc.clone(), PROVIDER_NAME).unwrap();
            assert!(candle.validate().is_ok());
        }
    }

    #[tokio::test]
    async fn history_is_deterministic() {
        let sim = adapter();
        let to = Interval::M5.duration_ms() * 12;

        let first = sim
            .get_historical_candles("BTC/USDT", Interval::M5, 0, to)
            .await
            .unwrap();
        let second = sim
            .get_historical_candles("BTC/USDT", Interval::M5, 0, to)
            .await
            .unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.timestamp, b.timestamp);
            assert_eq!(a.open, b.open);
            assert_eq!(a.close, b.close);
            assert_eq!(a.volume, b.volume);
        }
    }

    #[tokio::test]
    async fn different_symbols_walk_different_levels() {
        let sim = adapter();
        let to = Interval::M1.duration_ms() * 3;

        let a = sim
            .get_historical_candles("SIM/USD", Interval::M1, 0, to)
            .await
            .unwrap();
        let b = sim
            .get_historical_candles("ETH/USDT", Interval::M1, 0, to)
            .await
            .unwrap();
        assert_ne!(a[0].open, b[0].open);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_tracked() {
        let sim = adapter();

        sim.subscribe_candles("SIM/USD", Interval::M1).await.unwrap();
        sim.subscribe_candles("SIM/USD", Interval::M1).await.unwrap();
        sim.subscribe_candles("SIM/USD", Interval::M5).await.unwrap();

        let mut tracked = sim.tracked_subscriptions();
        tracked.sort();
        assert_eq!(
            tracked,
            vec![
                ("SIM/USD".to_string(), Interval::M1),
                ("SIM/USD".to_string(), Interval::M5),
            ]
        );

        sim.unsubscribe_candles("SIM/USD", Interval::M1).await.unwrap();
        sim.unsubscribe_candles("SIM/USD", Interval::M5).await.unwrap();
        assert!(sim.tracked_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn live_stream_emits_candles_once_connected() {
        let (tx, mut rx) = event_channel();
        let sim = SimAdapter::new(tx);

        sim.subscribe_candles("SIM/USD", Interval::M1).await.unwrap();
        sim.connect().await.unwrap();

        // Connect event first, then candle updates from the tick stream.
        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            crate::providers::ProviderEvent::Connectivity {
                connected: true,
                ..
            }
        ));

        let mut saw_candle = false;
        for _ in 0..4 {
            if let Some(crate::providers::ProviderEvent::Candle { candle, generation }) =
                rx.recv().await
            {
                assert_eq!(generation, sim.generation());
                assert_eq!(candle.symbol, "SIM/USD");
                assert_eq!(candle.interval, Interval::M1);
                assert!(candle.validate().is_ok());
                saw_candle = true;
                break;
            }
        }
        assert!(saw_candle);

        sim.disconnect().await;
        assert!(!sim.is_connected());
    }
}
