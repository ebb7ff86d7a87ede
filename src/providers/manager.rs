// =============================================================================
// Provider Manager — adapter ownership, configuration diffs, backfill
// =============================================================================
//
// The manager exclusively owns the adapter set. Declarative configuration is
// applied as a set difference against each adapter's tracked subscriptions —
// never as "unsubscribe all, resubscribe all" — and one provider's failure is
// collected per provider instead of aborting the rest. The manager also owns
// the reconnect policy: a 5-second retry loop per disconnect event, running
// while the provider stays enabled.
// =============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::providers::ProviderAdapter;
use crate::store::CandleStore;
use crate::types::{
    normalize_candle, BackfillRequest, BackfillResult, Interval, ProviderStatus, SubscriptionInfo,
    TimeRange,
};

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// One provider's failure during a configuration apply.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderFailure {
    pub provider: String,
    pub message: String,
}

pub struct ProviderManager {
    config: Arc<RwLock<ServiceConfig>>,
    store: Arc<CandleStore>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderManager {
    pub fn new(config: Arc<RwLock<ServiceConfig>>, store: Arc<CandleStore>) -> Self {
        Self {
            config,
            store,
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under its own name. Construction-time only.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Whether a live update from (provider, generation) should still be
    /// applied: the adapter is connected and the generation is current.
    pub fn is_live(&self, provider: &str, generation: u64) -> bool {
        self.adapters
            .get(provider)
            .is_some_and(|a| a.is_connected() && a.generation() == generation)
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Apply the current declarative configuration: connect/disconnect per
    /// `enabled`, then diff subscriptions per connected provider. Failures are
    /// collected per provider; one bad provider never blocks the others.
    pub async fn apply_configuration(&self) -> Vec<ProviderFailure> {
        let config = self.config.read().clone();
        let mut failures = Vec::new();

        for (name, settings) in &config.providers {
            let Some(adapter) = self.adapters.get(name) else {
                warn!(provider = %name, "configuration names an unknown provider");
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    message: "unknown provider".to_string(),
                });
                continue;
            };

            if !settings.enabled {
                if adapter.is_connected() {
                    adapter.disconnect().await;
                    info!(provider = %name, "provider disabled by configuration");
                }
                continue;
            }

            if !adapter.is_connected() {
                if let Err(e) = adapter.connect().await {
                    error!(provider = %name, error = %e, "provider connect failed");
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        message: format!("connect failed: {e}"),
                    });
                    continue;
                }
            }

            // Desired = configured symbols × intervals, filtered to what the
            // adapter actually serves.
            let supported = adapter.supported_intervals();
            let mut desired = BTreeSet::new();
            for symbol in &settings.symbols {
                for interval in &settings.intervals {
                    if supported.contains(interval) {
                        desired.insert((symbol.clone(), *interval));
                    } else {
                        warn!(
                            provider = %name,
                            symbol = %symbol,
                            interval = %interval,
                            "interval not served by provider — skipping"
                        );
                    }
                }
            }
            let tracked: BTreeSet<(String, Interval)> =
                adapter.tracked_subscriptions().into_iter().collect();
            let (to_add, to_remove) = subscription_diff(&desired, &tracked);

            for (symbol, interval) in to_remove {
                if let Err(e) = adapter.unsubscribe_candles(&symbol, interval).await {
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        message: format!("unsubscribe {symbol}:{interval} failed: {e}"),
                    });
                }
            }
            for (symbol, interval) in to_add {
                if let Err(e) = adapter.subscribe_candles(&symbol, interval).await {
                    failures.push(ProviderFailure {
                        provider: name.clone(),
                        message: format!("subscribe {symbol}:{interval} failed: {e}"),
                    });
                }
            }
        }

        failures
    }

    /// Status snapshot for every configured provider.
    pub fn provider_statuses(&self) -> Vec<ProviderStatus> {
        let config = self.config.read();
        let mut statuses: Vec<ProviderStatus> = config
            .providers
            .iter()
            .map(|(name, settings)| match self.adapters.get(name) {
                Some(adapter) => ProviderStatus {
                    name: name.clone(),
                    enabled: settings.enabled,
                    connected: adapter.is_connected(),
                    subscriptions: adapter
                        .tracked_subscriptions()
                        .into_iter()
                        .map(|(symbol, interval)| SubscriptionInfo { symbol, interval })
                        .collect(),
                    error_state: adapter.error_state(),
                },
                None => ProviderStatus {
                    name: name.clone(),
                    enabled: settings.enabled,
                    connected: false,
                    subscriptions: Vec::new(),
                    error_state: Some("unknown provider".to_string()),
                },
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    /// Run one historical backfill and insert the results idempotently.
    ///
    /// The adapter generation is captured before the fetch; if it changed by
    /// insert time (reconnect/reconfiguration), the results are discarded so a
    /// stale fetch cannot resurrect a torn-down subscription's data.
    pub async fn run_backfill(&self, request: &BackfillRequest) -> Result<BackfillResult> {
        let started = std::time::Instant::now();
        let adapter = self
            .adapters
            .get(&request.provider)
            .with_context(|| format!("unknown provider '{}'", request.provider))?;

        let default_hours = self.config.read().default_backfill_hours;
        let now = chrono::Utc::now().timestamp_millis();
        let (from, to) = resolve_backfill_window(request, default_hours, now)?;

        let generation = adapter.generation();
        let raw = adapter
            .get_historical_candles(&request.symbol, request.interval, from, to)
            .await
            .with_context(|| {
                format!(
                    "historical fetch failed for {} {}:{}",
                    request.provider, request.symbol, request.interval
                )
            })?;
        let fetched = raw.len();

        let mut candles = Vec::with_capacity(fetched);
        for rc in raw {
            match normalize_candle(rc, &request.provider) {
                Ok(candle) => candles.push(candle),
                Err(e) => warn!(error = %e, "skipping malformed historical candle"),
            }
        }

        if adapter.generation() != generation {
            anyhow::bail!(
                "provider '{}' reconfigured during backfill — discarding {} candles",
                request.provider,
                candles.len()
            );
        }

        let inserted = self.store.insert_batch(&candles)?;
        let result = BackfillResult {
            success: true,
            provider: request.provider.clone(),
            symbol: request.symbol.clone(),
            interval: request.interval,
            candles_fetched: fetched,
            candles_inserted: inserted,
            time_range: TimeRange { from, to },
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            provider = %result.provider,
            symbol = %result.symbol,
            interval = %result.interval,
            fetched = result.candles_fetched,
            inserted = result.candles_inserted,
            duration_ms = result.duration_ms,
            "backfill complete"
        );
        Ok(result)
    }

    /// Backfill every configured (symbol × interval) for providers with
    /// `backfill_on_startup`. Per-series failures are logged and skipped; one
    /// bad series never aborts the run.
    pub async fn startup_backfill(&self) {
        let config = self.config.read().clone();

        for (name, settings) in &config.providers {
            if !settings.enabled || !settings.backfill_on_startup {
                continue;
            }
            for symbol in &settings.symbols {
                for interval in &settings.intervals {
                    let request = BackfillRequest {
                        provider: name.clone(),
                        symbol: symbol.clone(),
                        interval: *interval,
                        from: None,
                        to: None,
                        hours: None,
                    };
                    if let Err(e) = self.run_backfill(&request).await {
                        warn!(
                            provider = %name,
                            symbol = %symbol,
                            interval = %interval,
                            error = %e,
                            "startup backfill failed for series"
                        );
                    }
                }
            }
        }
        info!("startup backfill pass finished");
    }

    // -------------------------------------------------------------------------
    // Reconnection
    // -------------------------------------------------------------------------

    /// React to a disconnect event for (provider, generation): retry
    /// `connect()` every 5 seconds while the provider stays enabled.
    /// The adapter respawns its tracked streams on successful connect.
    pub fn schedule_reconnect(self: Arc<Self>, provider: &str, generation: u64) {
        let manager = self;
        let provider = provider.to_string();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_DELAY).await;

                let enabled = manager
                    .config
                    .read()
                    .providers
                    .get(&provider)
                    .map(|p| p.enabled)
                    .unwrap_or(false);
                if !enabled {
                    info!(provider = %provider, "provider disabled — reconnect abandoned");
                    break;
                }

                let Some(adapter) = manager.adapters.get(&provider) else {
                    break;
                };
                if adapter.is_connected() || adapter.generation() != generation {
                    // Someone else already brought it back (or tore it down).
                    break;
                }

                match adapter.connect().await {
                    Ok(()) => {
                        info!(provider = %provider, "provider reconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "reconnect attempt failed — retrying in 5s");
                    }
                }
            }
        });
    }
}

// =============================================================================
// Pure helpers
// =============================================================================

/// Set difference between the configured subscription set and what an adapter
/// currently tracks.
pub fn subscription_diff(
    desired: &BTreeSet<(String, Interval)>,
    tracked: &BTreeSet<(String, Interval)>,
) -> (Vec<(String, Interval)>, Vec<(String, Interval)>) {
    let to_add = desired.difference(tracked).cloned().collect();
    let to_remove = tracked.difference(desired).cloned().collect();
    (to_add, to_remove)
}

/// Resolve a backfill request to a concrete inclusive `[from, to]` window.
pub fn resolve_backfill_window(
    request: &BackfillRequest,
    default_hours: u32,
    now_ms: i64,
) -> Result<(i64, i64)> {
    let hours = request.hours.unwrap_or(default_hours) as i64;
    let lookback_ms = hours * 3_600_000;

    let (from, to) = match (request.from, request.to) {
        (Some(from), Some(to)) => (from, to),
        (Some(from), None) => (from, now_ms),
        (None, Some(to)) => (to - lookback_ms, to),
        (None, None) => (now_ms - lookback_ms, now_ms),
    };

    if from > to {
        anyhow::bail!("invalid backfill window: from {from} > to {to}");
    }
    Ok((from, to))
}

// =============================================================================
// Tests
// =============================================================================
