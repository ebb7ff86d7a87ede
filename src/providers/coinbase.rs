// =============================================================================
// Coinbase Adapter — tick (`matches`) feed routed through the aggregator
// =============================================================================
//
// Coinbase Exchange streams individual trades, not candles, so this adapter
// owns a private CandleAggregator: one `matches` stream task runs per symbol,
// and every trade is folded into a window for each interval tracked on that
// symbol before the updated candle is emitted. Historical data comes from
// GET /products/{id}/candles in 300-row pages.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::CandleAggregator;
use crate::providers::{
    parse_string_f64, ProviderAdapter, ProviderCore, RateLimitMetadata, RateLimiter,
};
use crate::types::{Interval, RawCandle, Tick};

pub const PROVIDER_NAME: &str = "coinbase";

const REST_BASE: &str = "https://api.exchange.coinbase.com";
const WS_BASE: &str = "wss://ws-feed.exchange.coinbase.com";

/// Maximum candles Coinbase returns per historical request.
const MAX_CANDLES_PER_REQUEST: i64 = 300;

const SUPPORTED_SYMBOLS: &[&str] = &["BTC/USD", "ETH/USD", "SOL/USD", "LTC/USD", "ADA/USD"];

pub struct CoinbaseAdapter {
    core: Arc<ProviderCore>,
    http: reqwest::Client,
    limiter: RateLimiter,
    aggregator: Arc<Mutex<CandleAggregator>>,
}

impl CoinbaseAdapter {
    pub fn new(events: crate::providers::EventSender) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            core: Arc::new(ProviderCore::new(PROVIDER_NAME, events)),
            http,
            limiter: RateLimiter::new(RateLimitMetadata {
                requests_per_second: Some(10.0),
                requests_per_minute: None,
            }),
            aggregator: Arc::new(Mutex::new(CandleAggregator::new(PROVIDER_NAME))),
        }
    }

    /// "BTC/USD" → "BTC-USD".
    fn native_symbol(symbol: &str) -> String {
        symbol.replace('/', "-").to_uppercase()
    }

    /// Candle granularity in seconds for the intervals Coinbase serves.
    fn granularity_secs(interval: Interval) -> Result<i64> {
        match interval {
            Interval::M1 => Ok(60),
            Interval::M5 => Ok(300),
            Interval::M15 => Ok(900),
            Interval::H1 => Ok(3_600),
            Interval::D1 => Ok(86_400),
            other => anyhow::bail!("coinbase does not serve {other} candles"),
        }
    }

    fn spawn_match_stream(&self, symbol: &str) {
        let core = self.core.clone();
        let aggregator = self.aggregator.clone();
        let canonical = symbol.to_string();
        let handle = tokio::spawn(run_match_stream(core, aggregator, canonical.clone()));
        self.core.insert_task(canonical, handle);
    }
}

#[async_trait]
impl ProviderAdapter for CoinbaseAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    async fn connect(&self) -> Result<()> {
        self.core.abort_all_tasks();

        self.limiter.throttle().await;
        let url = format!("{REST_BASE}/time");
        let resp = self
            .http
            .get(&url)
            .header("User-Agent", "candela")
            .send()
            .await
            .context("coinbase connectivity check failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            self.core
                .report_error(format!("coinbase time endpoint returned {status}"));
            anyhow::bail!("coinbase time endpoint returned {status}");
        }

        self.core.mark_connected();
        info!("coinbase connected");

        // One match stream per tracked symbol feeds all of its intervals.
        let mut symbols: Vec<String> = self
            .core
            .tracked()
            .into_iter()
            .map(|(symbol, _)| symbol)
            .collect();
        symbols.dedup();
        for symbol in symbols {
            self.spawn_match_stream(&symbol);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.core.abort_all_tasks();
        self.core.mark_disconnected();
        info!("coinbase disconnected");
    }

    async fn subscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()> {
        Self::granularity_secs(interval)?;

        let first_for_symbol = self.core.tracked_intervals(symbol).is_empty();
        if !self.core.track(symbol, interval) {
            debug!(symbol, interval = %interval, "coinbase already subscribed");
            return Ok(());
        }
        if first_for_symbol && self.core.is_connected() {
            self.spawn_match_stream(symbol);
        }
        info!(symbol, interval = %interval, "coinbase subscription added");
        Ok(())
    }

    async fn unsubscribe_candles(&self, symbol: &str, interval: Interval) -> Result<()> {
        if !self.core.untrack(symbol, interval) {
            return Ok(());
        }
        // The symbol's stream only stops when its last interval is gone.
        if self.core.tracked_intervals(symbol).is_empty() {
            self.core.abort_task(symbol);
        }
        info!(symbol, interval = %interval, "coinbase subscription removed");
        Ok(())
    }

    /// GET /products/{id}/candles, paging in 300-candle windows.
    ///
    /// Response rows are `[time_s, low, high, open, close, volume]`,
    /// newest-first; the result is re-sorted ascending.
    #[instrument(skip(self), name = "coinbase::get_historical_candles")]
    async fn get_historical_candles(
        &self,
        symbol: &str,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Vec<RawCandle>> {
        let granularity = Self::granularity_secs(interval)?;
        let native = Self::native_symbol(symbol);
        let chunk_ms = MAX_CANDLES_PER_REQUEST * granularity * 1000;

        let mut out: Vec<RawCandle> = Vec::new();
        let mut window_from = from;

        while window_from <= to {
            let window_to = (window_from + chunk_ms - 1).min(to);
            let start = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(window_from)
                .context("backfill window start out of range")?;
            let end = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(window_to)
                .context("backfill window end out of range")?;

            self.limiter.throttle().await;
            let url = format!(
                "{REST_BASE}/products/{native}/candles?granularity={granularity}\
                 &start={}&end={}",
                start.to_rfc3339(),
                end.to_rfc3339()
            );

            let resp = self
                .http
                .get(&url)
                .header("User-Agent", "candela")
                .send()
                .await
                .context("GET /products/{id}/candles request failed")?;

            let status = resp.status();
            let body: serde_json::Value = resp
                .json()
                .await
                .context("failed to parse coinbase candles response")?;
            if !status.is_success() {
                anyhow::bail!("coinbase candles request returned {status}: {body}");
            }

            let rows = body
                .as_array()
                .context("coinbase candles response is not an array")?;
            for row in rows {
                let arr = row.as_array().context("candle row is not an array")?;
                if arr.len() < 6 {
                    warn!(elements = arr.len(), "skipping malformed coinbase candle row");
                    continue;
                }
                let time_s = arr[0].as_i64().context("candle row missing time")?;
                out.push(RawCandle {
                    symbol: symbol.to_string(),
                    interval,
                    timestamp: time_s * 1000,
                    low: parse_string_f64(&arr[1], "candle.low")?,
                    high: parse_string_f64(&arr[2], "candle.high")?,
                    open: parse_string_f64(&arr[3], "candle.open")?,
                    close: parse_string_f64(&arr[4], "candle.close")?,
                    volume: parse_string_f64(&arr[5], "candle.volume")?,
                    provider: Some(PROVIDER_NAME.to_string()),
                    extra: serde_json::Map::new(),
                });
            }

            window_from = window_to + 1;
        }

        out.sort_by_key(|c| c.timestamp);
        out.dedup_by_key(|c| c.timestamp);
        debug!(symbol, interval = %interval, count = out.len(), "coinbase candles fetched");
        Ok(out)
    }

    fn rate_limit_metadata(&self) -> RateLimitMetadata {
        self.limiter.metadata()
    }

    fn supported_symbols(&self) -> Vec<String> {
        SUPPORTED_SYMBOLS.iter().map(|s| s.to_string()).collect()
    }

    fn supported_intervals(&self) -> Vec<Interval> {
        vec![
            Interval::M1,
            Interval::M5,
            Interval::M15,
            Interval::H1,
            Interval::D1,
        ]
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
// Match WebSocket stream
// =============================================================================

/// Run the `matches` stream for one product, folding every trade through the
/// aggregator into a candle per tracked interval. Ends by flagging the
/// adapter disconnected; reconnection belongs to the ProviderManager.
async fn run_match_stream(
    core: Arc<ProviderCore>,
    aggregator: Arc<Mutex<CandleAggregator>>,
    symbol: String,
) {
    let native = CoinbaseAdapter::native_symbol(&symbol);
    info!(symbol = %symbol, "connecting to coinbase match WebSocket");

    match connect_async(WS_BASE).await {
        Ok((ws_stream, _response)) => {
            let (mut write, mut read) = ws_stream.split();

            let subscribe = serde_json::json!({
                "type": "subscribe",
                "product_ids": [native],
                "channels": ["matches"],
            })
            .to_string();
            if let Err(e) = write
                .send(tokio_tungstenite::tungstenite::Message::Text(subscribe.into()))
                .await
            {
                core.report_error(format!("coinbase subscribe send failed: {e}"));
                core.mark_disconnected();
                return;
            }
            info!(symbol = %symbol, "coinbase match WebSocket connected");

            loop {
                match read.next().await {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match parse_match_message(&text) {
                            Ok(Some(tick)) => {
                                // Fold the trade into every interval tracked
                                // for this symbol; each fold emits an update.
                                let intervals = core.tracked_intervals(&symbol);
                                let mut agg = aggregator.lock();
                                for interval in intervals {
                                    let candle = agg.apply_tick(&symbol, interval, &tick);
                                    core.emit_candle(candle);
                                }
                            }
                            Ok(None) => {} // heartbeats, acks, errors handled below
                            Err(e) => warn!(error = %e, "failed to parse match message"),
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        core.report_error(format!("match stream read error: {e}"));
                        break;
                    }
                    None => {
                        warn!(symbol = %symbol, "coinbase match stream ended");
                        break;
                    }
                }
            }
        }
        Err(e) => {
            core.report_error(format!("match stream connect failed: {e}"));
        }
    }

    core.mark_disconnected();
}

/// Parse a `match` (trade) payload into a Tick. Returns `Ok(None)` for
/// non-trade payloads such as subscription acks and heartbeats.
///
/// Expected shape:
/// ```json
/// { "type": "match", "product_id": "BTC-USD", "price": "37000.00",
///   "size": "0.12", "time": "2023-11-14T22:13:20.000000Z" }
/// ```
fn parse_match_message(text: &str) -> Result<Option<Tick>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse match JSON")?;

    match root["type"].as_str() {
        Some("match") | Some("last_match") => {}
        _ => return Ok(None),
    }

    let price = parse_string_f64(&root["price"], "match.price")?;
    let size = parse_string_f64(&root["size"], "match.size")?;
    let time = root["time"].as_str().context("missing field time")?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(time)
        .context("failed to parse match time")?
        .timestamp_millis();

    Ok(Some(Tick {
        price,
        size,
        timestamp,
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_symbol_uses_dash() {
        assert_eq!(CoinbaseAdapter::native_symbol("BTC/USD"), "BTC-USD");
    }

    #[test]
    fn granularity_covers_served_intervals_only() {
        assert_eq!(CoinbaseAdapter::granularity_secs(Interval::M1).unwrap(), 60);
        assert_eq!(
            CoinbaseAdapter::granularity_secs(Interval::D1).unwrap(),
            86_400
        );
        assert!(CoinbaseAdapter::granularity_secs(Interval::W1).is_err());
        assert!(CoinbaseAdapter::granularity_secs(Interval::M30).is_err());
    }

    #[test]
    fn parse_match_message_ok() {
        let json = r#"{
            "type": "match",
            "trade_id": 12345,
            "product_id": "BTC-USD",
            "price": "37000.50",
            "size": "0.25",
            "side": "buy",
            "time": "2023-11-14T22:13:20.000000Z"
        }"#;
        let tick = parse_match_message(json).unwrap().unwrap();
        assert!((tick.price - 37000.5).abs() < f64::EPSILON);
        assert!((tick.size - 0.25).abs() < f64::EPSILON);
        assert_eq!(tick.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn non_trade_payloads_are_skipped() {
        let json = r#"{ "type": "subscriptions", "channels": [] }"#;
        assert!(parse_match_message(json).unwrap().is_none());

        let json = r#"{ "type": "heartbeat", "sequence": 1 }"#;
        assert!(parse_match_message(json).unwrap().is_none());
    }

    #[test]
    fn malformed_trade_is_an_error() {
        let json = r#"{ "type": "match", "price": "nan-ish", "size": "0.1",
                        "time": "2023-11-14T22:13:20Z" }"#;
        assert!(parse_match_message(json).is_err());
    }
}
