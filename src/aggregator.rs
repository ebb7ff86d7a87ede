// =============================================================================
// Candle Aggregator — folds raw ticks into fixed-width OHLCV windows
// =============================================================================
//
// Tick-sourcing providers own one aggregator each and drive it from their
// stream task, so the structure itself needs no locking. Every tick produces
// an updated copy of its window's candle; consumers receive repeated updates
// for the same window until a later tick implicitly starts the next one.
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use crate::types::{Interval, OHLCVCandle, Tick};

/// Open windows retained per (symbol, interval). Late ticks within this
/// horizon fold into their original window; beyond it the window is rebuilt
/// and the idempotent store absorbs the duplicate.
const MAX_OPEN_WINDOWS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    symbol: String,
    interval: Interval,
}

/// Per-provider tick aggregation state.
pub struct CandleAggregator {
    provider: String,
    windows: HashMap<SeriesKey, BTreeMap<i64, OHLCVCandle>>,
}

impl CandleAggregator {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            windows: HashMap::new(),
        }
    }

    /// Fold one tick into its (symbol, interval) window and return the updated
    /// candle for emission.
    ///
    /// Ticks are applied strictly in arrival order: the last-applied tick wins
    /// `close`, even when timestamps tie or arrive out of order. A tick whose
    /// window is not the newest one updates that older window in place.
    pub fn apply_tick(&mut self, symbol: &str, interval: Interval, tick: &Tick) -> OHLCVCandle {
        let window_start = interval.window_start(tick.timestamp);
        let series = self
            .windows
            .entry(SeriesKey {
                symbol: symbol.to_string(),
                interval,
            })
            .or_default();

        let candle = series
            .entry(window_start)
            .and_modify(|c| {
                c.high = c.high.max(tick.price);
                c.low = c.low.min(tick.price);
                c.close = tick.price;
                c.volume += tick.size;
            })
            .or_insert_with(|| OHLCVCandle {
                symbol: symbol.to_string(),
                interval,
                timestamp: window_start,
                open: tick.price,
                high: tick.price,
                low: tick.price,
                close: tick.price,
                volume: tick.size,
                provider: self.provider.clone(),
            });
        let update = candle.clone();

        while series.len() > MAX_OPEN_WINDOWS {
            series.pop_first();
        }

        update
    }

    /// Number of windows currently held open for a series.
    pub fn open_windows(&self, symbol: &str, interval: Interval) -> usize {
        self.windows
            .get(&SeriesKey {
                symbol: symbol.to_string(),
                interval,
            })
            .map_or(0, BTreeMap::len)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64, size: f64, timestamp: i64) -> Tick {
        Tick {
            price,
            size,
            timestamp,
        }
    }

    #[test]
    fn folds_ticks_into_ohlcv() {
        let mut agg = CandleAggregator::new("sim");
        let base = 1_700_000_040_000; // 1m-aligned

        agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, base + 1_000));
        agg.apply_tick("BTC/USDT", Interval::M1, &tick(105.0, 2.0, base + 2_000));
        let candle = agg.apply_tick("BTC/USDT", Interval::M1, &tick(98.0, 3.0, base + 3_000));

        assert_eq!(candle.open, 100.0);
        assert_eq!(candle.high, 105.0);
        assert_eq!(candle.low, 98.0);
        assert_eq!(candle.close, 98.0);
        assert_eq!(candle.volume, 6.0);
        assert_eq!(candle.timestamp, base);
        assert_eq!(candle.provider, "sim");
        assert!(candle.validate().is_ok());
    }

    #[test]
    fn emits_update_for_every_tick() {
        let mut agg = CandleAggregator::new("sim");
        let base = 0;

        let first = agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, base));
        assert_eq!(first.close, 100.0);
        assert_eq!(first.volume, 1.0);

        let second = agg.apply_tick("BTC/USDT", Interval::M1, &tick(101.0, 1.0, base + 1));
        assert_eq!(second.close, 101.0);
        assert_eq!(second.volume, 2.0);
        assert_eq!(second.open, 100.0);
    }

    #[test]
    fn window_boundary_starts_a_new_window() {
        let mut agg = CandleAggregator::new("sim");
        let base = 1_700_000_040_000;
        let interval_ms = Interval::M1.duration_ms();

        let prev = agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, base + 500));
        // A tick exactly at windowStart + intervalMs opens the next window.
        let next = agg.apply_tick(
            "BTC/USDT",
            Interval::M1,
            &tick(200.0, 1.0, base + interval_ms),
        );

        assert_eq!(prev.timestamp, base);
        assert_eq!(next.timestamp, base + interval_ms);
        assert_eq!(next.open, 200.0);
        assert_eq!(next.volume, 1.0);

        // The previous window's candle was not mutated by the boundary tick.
        let late = agg.apply_tick("BTC/USDT", Interval::M1, &tick(90.0, 1.0, base + 900));
        assert_eq!(late.timestamp, base);
        assert_eq!(late.open, 100.0);
        assert_eq!(late.high, 100.0);
        assert_eq!(agg.open_windows("BTC/USDT", Interval::M1), 2);
    }

    #[test]
    fn out_of_order_tick_updates_its_own_window() {
        let mut agg = CandleAggregator::new("sim");
        let interval_ms = Interval::M1.duration_ms();

        agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, 0));
        agg.apply_tick("BTC/USDT", Interval::M1, &tick(110.0, 1.0, interval_ms));

        // Late tick for the first window folds in, no rejection.
        let updated = agg.apply_tick("BTC/USDT", Interval::M1, &tick(95.0, 2.0, 30_000));
        assert_eq!(updated.timestamp, 0);
        assert_eq!(updated.low, 95.0);
        assert_eq!(updated.close, 95.0);
        assert_eq!(updated.volume, 3.0);
    }

    #[test]
    fn equal_timestamps_apply_in_arrival_order() {
        let mut agg = CandleAggregator::new("sim");

        agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, 1_000));
        let last = agg.apply_tick("BTC/USDT", Interval::M1, &tick(99.0, 1.0, 1_000));
        assert_eq!(last.close, 99.0);
        assert_eq!(last.high, 100.0);
    }

    #[test]
    fn series_are_independent() {
        let mut agg = CandleAggregator::new("sim");

        let btc = agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, 0));
        let eth = agg.apply_tick("ETH/USDT", Interval::M1, &tick(10.0, 1.0, 0));
        let btc_5m = agg.apply_tick("BTC/USDT", Interval::M5, &tick(101.0, 1.0, 0));

        assert_eq!(btc.symbol, "BTC/USDT");
        assert_eq!(eth.open, 10.0);
        assert_eq!(btc_5m.interval, Interval::M5);
        assert_eq!(btc_5m.open, 101.0);
    }

    #[test]
    fn open_windows_are_capped() {
        let mut agg = CandleAggregator::new("sim");
        let interval_ms = Interval::M1.duration_ms();

        for i in 0..(MAX_OPEN_WINDOWS as i64 + 4) {
            agg.apply_tick("BTC/USDT", Interval::M1, &tick(100.0, 1.0, i * interval_ms));
        }
        assert_eq!(
            agg.open_windows("BTC/USDT", Interval::M1),
            MAX_OPEN_WINDOWS
        );
    }
}
