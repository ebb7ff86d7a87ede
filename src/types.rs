// =============================================================================
// Shared types used across the Candela market data service
// =============================================================================

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Interval
// =============================================================================

/// Fixed candle interval. The variant order matches the duration order, so the
/// derived `Ord` sorts intervals from shortest to longest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
}

impl Interval {
    /// Every supported interval, shortest first.
    pub const ALL: [Interval; 8] = [
        Interval::M1,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H4,
        Interval::D1,
        Interval::W1,
    ];

    /// Window width in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Interval::M1 => 60_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::M30 => 1_800_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::D1 => 86_400_000,
            Interval::W1 => 604_800_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
            Interval::W1 => "1w",
        }
    }

    /// Start of the window containing `timestamp` (ms UTC), aligned so that
    /// `window_start % duration_ms == 0`.
    pub fn window_start(self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.duration_ms())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not one of the supported intervals.
#[derive(Debug)]
pub struct ParseIntervalError(String);

impl fmt::Display for ParseIntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown interval '{}'", self.0)
    }
}

impl std::error::Error for ParseIntervalError {}

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|iv| iv.as_str() == s)
            .ok_or_else(|| ParseIntervalError(s.to_string()))
    }
}

// =============================================================================
// Ticks and candles
// =============================================================================

/// A single timestamped trade observation from a live feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub price: f64,
    pub size: f64,
    /// Trade time, ms UTC.
    pub timestamp: i64,
}

/// Provider-native OHLCV sample before normalization. Whatever extra fields a
/// provider attaches (trade counts, quote volumes, close flags, ...) land in
/// the flattened `extra` bag and are discarded by [`normalize_candle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCandle {
    pub symbol: String,
    pub interval: Interval,
    /// Sample time, ms UTC; not necessarily window-aligned.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Canonical OHLCV candle as stored and fanned out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OHLCVCandle {
    pub symbol: String,
    pub interval: Interval,
    /// Window start, ms UTC, aligned to the interval boundary.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub provider: String,
}

impl OHLCVCandle {
    /// Check the canonical-candle invariants.
    pub fn validate(&self) -> Result<()> {
        if self.high < self.low {
            anyhow::bail!("high {} < low {}", self.high, self.low);
        }
        if self.high < self.open.max(self.close) {
            anyhow::bail!("high {} below open/close", self.high);
        }
        if self.low > self.open.min(self.close) {
            anyhow::bail!("low {} above open/close", self.low);
        }
        if self.volume < 0.0 {
            anyhow::bail!("negative volume {}", self.volume);
        }
        if self.timestamp % self.interval.duration_ms() != 0 {
            anyhow::bail!(
                "timestamp {} not aligned to {} window",
                self.timestamp,
                self.interval
            );
        }
        Ok(())
    }
}

/// Pure mapping step from a provider-native candle to the canonical form.
///
/// Floors the timestamp to the window boundary, drops every provider-specific
/// extra field, and rejects candles that violate the price/volume invariants.
pub fn normalize_candle(raw: RawCandle, provider: &str) -> Result<OHLCVCandle> {
    let candle = OHLCVCandle {
        timestamp: raw.interval.window_start(raw.timestamp),
        symbol: raw.symbol,
        interval: raw.interval,
        open: raw.open,
        high: raw.high,
        low: raw.low,
        close: raw.close,
        volume: raw.volume,
        provider: raw.provider.unwrap_or_else(|| provider.to_string()),
    };
    candle
        .validate()
        .with_context(|| format!("malformed candle from {}", candle.provider))?;
    Ok(candle)
}

// =============================================================================
// Provider status
// =============================================================================

/// One active (symbol, interval) subscription on a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub symbol: String,
    pub interval: Interval,
}

/// On-demand snapshot of a configured provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub enabled: bool,
    pub connected: bool,
    pub subscriptions: Vec<SubscriptionInfo>,
    pub error_state: Option<String>,
}

// =============================================================================
// Signals
// =============================================================================

/// Signal action produced by the analytics service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// Trading signal pushed in by the analytics service and fanned out to
/// `symbol:interval:strategy_id` subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub interval: Interval,
    pub timestamp: i64,
    pub action: SignalAction,
    pub confidence: f64,
    pub strategy_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// =============================================================================
// Backfill
// =============================================================================

/// Inbound backfill trigger. Either an explicit `[from, to]` window or an
/// `hours` lookback against now; with neither, the configured default lookback
/// applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub provider: String,
    pub symbol: String,
    pub interval: Interval,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default)]
    pub hours: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
}

/// Outcome of one backfill run for a single (provider, symbol, interval).
#[derive(Debug, Clone, Serialize)]
pub struct BackfillResult {
    pub success: bool,
    pub provider: String,
    pub symbol: String,
    pub interval: Interval,
    pub candles_fetched: usize,
    pub candles_inserted: u64,
    pub time_range: TimeRange,
    pub duration_ms: u64,
}

// =============================================================================
// Tests
// =============================================================================
