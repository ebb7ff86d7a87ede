// =============================================================================
// Binance Adapter — native kline (candle) feed + REST historical klines
// =============================================================================
//
// Binance pushes ready-made OHLCV klines over WebSocket, so this adapter
// emits normalized candles directly without tick aggregation. One stream task
// runs per (symbol, interval) subscription; historical fetches page through
// GET /api/v3/klines under the shared rate limiter.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, instrument, warn};

use crate::providers::{
    parse_string_f64, ProviderAdapter, ProviderCore, RateLimitMetadata, RateLimiter,
};
use crate::types::{normalize_candle, Interval, RawCandle};

pub const PROVIDER_NAME: &str = "binance";

const REST_BASE: &str = "https://api.binance.com";
const WS_BASE: &str = "wss://stream.binance.com:9443";

/// Maximum klines Binance returns per request; larger ranges page.
const MAX_KLINES_PER_REQUEST: usize = 1000;

/// Fallback symbol set used until exchangeInfo has been fetched.
const DEFAULT_SYMBOLS: &[&str] = &["BTC/USDT", "ETH/USDT", "BNB/USDT", "XRP/USDT", "SOL/USDT"];

pub struct BinanceAdapter {
    core: Arc<ProviderCore>,
    http: reqwest::Client,
    limiter: RateLimiter,
    symbols: RwLock<Vec<String>>,
}

impl BinanceAdapter {
    pub fn new(events: crate::providers::EventSender) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            core: Arc::new(ProviderCore::new(PROVIDER_NAME, events)),
            http,
            limiter: RateLimiter::new(RateLimitMetadata {
                requests_per_second: Some(20.0),
                // Self-capped under the exchange's 1200 weight/min budget.
                requests_per_minute: Some(1100),
            }),
            symbols: RwLock::new(DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// "BTC/USDT" → "BTCUSDT".
    fn native_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    fn spawn_kline_stream(&self, symbol: &str, interval: Interval) {
        let core = self.core.clone();
        let canonical = symbol.to_string();
        let url = format!(
            "{WS_BASE}/ws/{}@kline_{}",
            Self::native_symbol(symbol).to_lowercase(),
            interval
        );
        let key = format!("{canonical}:{interval}");
        let handle = tokio::spawn(run_kline_stream(core, canonical, interval, url));
        self.core.insert_task(key, handle);
    }

    /// Refresh the supported-symbol cache from exchangeInfo. Best effort: a
    /// failure keeps the previous cache.
    async fn refresh_supported_symbols(&self) -> Result<()> {
        self.limiter.throttle().await;
        let url = format!("{REST_BASE}/api/v3/exchangeInfo");
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/exchangeInfo request failed")?
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;

        let entries = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols' array")?;

        let mut symbols = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry["status"].as_str() != Some("TRADING") {
                continue;
            }
            if let (Some(base), Some(quote)) =
                (entry["baseAsset"].as_str(), entry["quoteAsset"].as_str())
            {
                symbols.push(format!("{base}/{quote}"));
            }
        }
        if !symbols.is_empty() {
            debug!(count = symbols.len(), "binance supported symbols refreshed");
            *self.symbols.write() = symbols;
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn connect(&self) -> Result<()> {
        self.core.abort_all_tasks();

        self.limiter.throttle().await;
        let url = format!("{REST_BASE}/api/v3/ping");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("binance connectivity check failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            self.core
                .report_error(format!("binance ping returned {status}"));
            anyhow::bail!("binance ping returned {status}");
        }

        if let Err(e) = self.refresh_supported_symbols().await {
            warn!(error = %e, "could not refresh binance symbol list — keeping cached set");
        }

        self.core.mark_connected();
        info!("binance connected");

        for (symbol, interval) in self.core.tracked() {
            self.spawn_kline_stream(&symbol, interval);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.core.abort_all_tasks();
        self.core.mark_disconnected();
        info!("binance disconnected");
    }

    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()> {
        if !self.core.track(symbol, interval) {
            debug!(symbol, interval = %interval, "binance already subscribed");
            return Ok(());
        }
        if self.core.is_connected() {
            self.spawn_kline_stream(symbol, interval);
        }
        info!(symbol, interval = %interval, "binance kline subscription added");
        Ok(())
    }

    async fn unsubscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()> {
        if !self.core.untrack(symbol, interval) {
            return Ok(());
        }
        self.core.abort_task(&format!("{symbol}:{interval}"));
        info!(symbol, interval = %interval, "binance kline subscription removed");
        Ok(())
    }

    /// GET /api/v3/klines, paging forward until the window is covered.
    ///
    /// Array indices per kline entry:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades, ...
    #[instrument(skip(self), name = "binance::get_historical_candles")]
    async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Vec<RawCandle>> {
        let native = Self::native_symbol(symbol);
        let mut out: Vec<RawCandle> = Vec::new();
        let mut cursor = from;

        loop {
            self.limiter.throttle().await;
            let url = format!(
                "{REST_BASE}/api/v3/klines?symbol={native}&interval={interval}\
                 &startTime={cursor}&endTime={to}&limit={MAX_KLINES_PER_REQUEST}",
            );

            let resp = self
                .http
                .get(&url)
                .send()
                .await
                .context("GET /api/v3/klines request failed")?;

            let status = resp.status();
            let body: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse klines response")?;
            if !status.is_success() {
                anyhow::bail!("binance GET /api/v3/klines returned {status}: {body}");
            }

            let raw = body.as_array().context("klines response is not an array")?;
            if raw.is_empty() {
                break;
            }

            let batch_len = raw.len();
            let mut last_ts = cursor;
            for entry in raw {
                let arr = entry.as_array().context("kline entry is not an array")?;
                if arr.len() < 9 {
                    warn!(elements = arr.len(), "skipping malformed kline entry");
                    continue;
                }

                let timestamp = arr[0].as_i64().context("kline missing open time")?;
                last_ts = timestamp;

                let mut extra = serde_json::Map::new();
                extra.insert("close_time".into(), arr[6].clone());
                extra.insert("quote_volume".into(), arr[7].clone());
                extra.insert("trades_count".into(), arr[8].clone());

                out.push(RawCandle {
                    symbol: symbol.to_string(),
                    interval,
                    timestamp,
                    open: parse_string_f64(&arr[1], "kline.open")?,
                    high: parse_string_f64(&arr[2], "kline.high")?,
                    low: parse_string_f64(&arr[3], "kline.low")?,
                    close: parse_string_f64(&arr[4], "kline.close")?,
                    volume: parse_string_f64(&arr[5], "kline.volume")?,
                    provider: Some(PROVIDER_NAME.to_string()),
                    extra,
                });
            }

            let next = last_ts + interval.duration_ms();
            if batch_len < MAX_KLINES_PER_REQUEST || next > to {
                break;
            }
            cursor = next;
        }

        debug!(symbol, interval = %interval, count = out.len(), "binance klines fetched");
        Ok(out)
    }

    fn rate_limit_metadata(&self) -> RateLimitMetadata {
        self.limiter.metadata()
    }

    fn supported_symbols(&self) -> Vec<String> {
        self.symbols.read().clone()
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
// Kline WebSocket stream
// =============================================================================

/// Run one kline stream until the transport drops, then flag the adapter
/// disconnected. Reconnection is the ProviderManager's call, not ours.
async fn run_kline_stream(
    core: Arc<ProviderCore>,
    symbol: String,
    interval: Interval,
    url: String,
) {
    info!(url = %url, symbol = %symbol, interval = %interval, "connecting to kline WebSocket");

    match connect_async(&url).await {
        Ok((ws_stream, _response)) => {
            info!(symbol = %symbol, interval = %interval, "kline WebSocket connected");
            let (_write, mut read) = ws_stream.split();

            loop {
                match read.next().await {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match parse_kline_message(&symbol, interval, &text) {
                            Ok(Some(raw)) => match normalize_candle(raw, core.name()) {
                                Ok(candle) => core.emit_candle(candle),
                                Err(e) => {
                                    warn!(error = %e, "discarding kline that failed normalization")
                                }
                            },
                            Ok(None) => {} // control payload, not a kline
                            Err(e) => warn!(error = %e, "failed to parse kline message"),
                        }
                    }
                    // Ping/Pong/Binary frames — tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        core.report_error(format!("kline stream read error: {e}"));
                        break;
                    }
                    None => {
                        warn!(symbol = %symbol, interval = %interval, "kline WebSocket stream ended");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            core.report_error(format!("kline stream connect failed: {e}"));
        }
    }

    core.mark_disconnected();
}

/// Parse a kline payload into a RawCandle. Returns `Ok(None)` for non-kline
/// payloads (subscription acks etc.).
///
/// Expected shape (single stream, with optional combined-stream envelope):
/// ```json
/// { "e": "kline", "s": "BTCUSDT", "k": { "t": ..., "o": "...", ... } }
/// ```
fn parse_kline_message(symbol: &str, interval: Interval, text: &str) -> Result<Option<RawCandle>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse kline JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let Some(k) = data.get("k") else {
        return Ok(None);
    };

    let timestamp = k["t"].as_i64().context("missing field k.t")?;

    let mut extra = serde_json::Map::new();
    extra.insert("close_time".into(), k["T"].clone());
    extra.insert("is_closed".into(), k["x"].clone());
    extra.insert("trades_count".into(), k["n"].clone());
    extra.insert("quote_volume".into(), k["q"].clone());

    Ok(Some(RawCandle {
        symbol: symbol.to_string(),
        interval,
        timestamp,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        provider: Some(PROVIDER_NAME.to_string()),
        extra,
    }))
}

// =============================================================================
// Tests
// =============================================================================
