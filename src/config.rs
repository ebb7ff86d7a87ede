// =============================================================================
// Service Configuration — Declarative provider setup with atomic save
// =============================================================================
//
// The single configuration hub for the Candela service. Providers are driven
// entirely by this file: enabling, disabling, and (symbol, interval)
// subscription sets are applied as a diff by the ProviderManager, so the file
// can be re-applied at runtime without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::Interval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_backfill_hours() -> u32 {
    24
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_database_path() -> String {
    "candela.db".to_string()
}

fn default_max_page_limit() -> u32 {
    500
}

fn default_intervals() -> Vec<Interval> {
    vec![Interval::M1, Interval::M5]
}

fn default_providers() -> HashMap<String, ProviderSettings> {
    let mut providers = HashMap::new();
    providers.insert(
        "binance".to_string(),
        ProviderSettings {
            enabled: true,
            symbols: vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()],
            intervals: default_intervals(),
            backfill_on_startup: true,
        },
    );
    providers.insert(
        "coinbase".to_string(),
        ProviderSettings {
            enabled: false,
            symbols: vec!["BTC/USD".to_string()],
            intervals: vec![Interval::M1],
            backfill_on_startup: false,
        },
    );
    providers.insert(
        "sim".to_string(),
        ProviderSettings {
            enabled: false,
            symbols: vec!["SIM/USD".to_string()],
            intervals: vec![Interval::M1],
            backfill_on_startup: false,
        },
    );
    providers
}

// =============================================================================
// ProviderSettings
// =============================================================================

/// Declarative per-provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Whether the provider should be connected at all.
    #[serde(default)]
    pub enabled: bool,

    /// Canonical symbols (e.g. "BTC/USDT") the provider should stream.
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Intervals subscribed for every configured symbol.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<Interval>,

    /// Run a historical backfill for each (symbol, interval) on startup.
    #[serde(default)]
    pub backfill_on_startup: bool,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            symbols: Vec::new(),
            intervals: default_intervals(),
            backfill_on_startup: false,
        }
    }
}

// =============================================================================
// ServiceConfig
// =============================================================================

/// Top-level configuration for the Candela service.
///
/// Every field has a serde default so that older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Provider name → declarative settings.
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderSettings>,

    /// Lookback used by startup backfills and backfill requests that give
    /// neither an explicit window nor an hour count.
    #[serde(default = "default_backfill_hours")]
    pub default_backfill_hours: u32,

    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database file for the candle store.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Upper bound on `limit` for cursor-paged candle queries.
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            default_backfill_hours: default_backfill_hours(),
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            max_page_limit: default_max_page_limit(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            providers = config.providers.len(),
            "service config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "service config saved (atomic)");
        Ok(())
    }
}
