// =============================================================================
// Candela Market Data Service — Main Entry Point
// =============================================================================
//
// Pipeline: provider adapters → normalization/aggregation → candle store →
// WebSocket fan-out. Providers come up according to the declarative config;
// enabled providers with backfill_on_startup fill in recent history in the
// background.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod config;
mod dispatcher;
mod providers;
mod sessions;
mod store;
mod types;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::ServiceConfig;
use crate::providers::binance::BinanceAdapter;
use crate::providers::coinbase::CoinbaseAdapter;
use crate::providers::sim::SimAdapter;
use crate::providers::ProviderManager;
use crate::sessions::SubscriptionRegistry;
use crate::store::CandleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candela Market Data Service — Starting Up        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path = PathBuf::from(
        std::env::var("CANDELA_CONFIG").unwrap_or_else(|_| "candela.json".into()),
    );
    let mut config = ServiceConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        ServiceConfig::default()
    });

    if let Ok(addr) = std::env::var("CANDELA_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Ok(path) = std::env::var("CANDELA_DATABASE_PATH") {
        config.database_path = path;
    }

    info!(
        providers = ?config.providers.keys().collect::<Vec<_>>(),
        database = %config.database_path,
        "service configured"
    );

    // ── 2. Storage, registry, event channel ─────────────────────────────
    let store = Arc::new(CandleStore::open(&config.database_path)?);
    let registry = Arc::new(SubscriptionRegistry::new());
    let (events, event_rx) = providers::event_channel();

    // ── 3. Providers ─────────────────────────────────────────────────────
    let config = Arc::new(RwLock::new(config));
    let mut manager = ProviderManager::new(config.clone(), store.clone());
    manager.register(Arc::new(BinanceAdapter::new(events.clone())));
    manager.register(Arc::new(CoinbaseAdapter::new(events.clone())));
    manager.register(Arc::new(SimAdapter::new(events.clone())));
    let manager = Arc::new(manager);

    // ── 4. Shared state & dispatcher ─────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        config_path.clone(),
        store,
        registry,
        manager.clone(),
    ));
    tokio::spawn(dispatcher::run(state.clone(), event_rx));

    // ── 5. Bring providers up per configuration ──────────────────────────
    let failures = manager.apply_configuration().await;
    for failure in &failures {
        error!(provider = %failure.provider, message = %failure.message, "provider failed to configure");
        state.push_error(format!("{}: {}", failure.provider, failure.message));
    }

    // ── 6. Startup backfill (background) ─────────────────────────────────
    let backfill_manager = manager.clone();
    tokio::spawn(async move {
        backfill_manager.startup_backfill().await;
    });

    // ── 7. API server ────────────────────────────────────────────────────
    let bind_addr = config.read().bind_addr.clone();
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = config.read().save(&config_path) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Candela shut down complete.");
    Ok(())
}
