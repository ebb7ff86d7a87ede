// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public endpoints live under `/api/v1/`; the `/internal/` surface serves the
// analytics service. CORS is configured permissively for development; tighten
// `allowed_origins` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::store::{DeleteFilter, PageDirection};
use crate::types::{BackfillRequest, Interval, Signal};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        // ── Health ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Candle queries ──────────────────────────────────────────
        .route("/api/v1/candles", get(candles_range).delete(candles_delete))
        .route("/api/v1/candles/page", get(candles_page))
        .route("/api/v1/candles/latest", get(candles_latest))
        .route("/api/v1/statistics", get(statistics))
        // ── Providers & configuration ───────────────────────────────
        .route("/api/v1/providers", get(providers_status))
        .route("/api/v1/config", get(get_config).put(put_config))
        .route("/api/v1/backfill", post(run_backfill))
        .route("/api/v1/errors", get(recent_errors))
        // ── Internal surface (analytics service) ────────────────────
        .route("/internal/candles", get(internal_candles))
        .route("/internal/signals", post(publish_signals))
        // ── WebSocket (handled in the ws module, mounted here) ──────
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn bad_request(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn internal_error(message: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": message })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "candela",
        "uptime_s": state.uptime_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
        "connections": state.registry.connection_count(),
        "subscriptions": state.registry.subscription_count(),
    }))
}

// =============================================================================
// Candle queries
// =============================================================================

#[derive(Deserialize)]
struct RangeQuery {
    symbol: String,
    interval: Interval,
    from: i64,
    to: i64,
    provider: Option<String>,
}

async fn candles_range(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let result = match &query.provider {
        Some(provider) => state.store.get_by_range_for_provider(
            provider,
            &query.symbol,
            query.interval,
            query.from,
            query.to,
        ),
        None => state
            .store
            .get_by_range(&query.symbol, query.interval, query.from, query.to),
    };

    match result {
        Ok(candles) => Json(json!({ "count": candles.len(), "candles": candles })).into_response(),
        Err(e) => internal_error(format!("range query failed: {e}")).into_response(),
    }
}

#[derive(Deserialize)]
struct PageQuery {
    provider: String,
    symbol: String,
    interval: Interval,
    cursor: i64,
    direction: PageDirection,
    limit: Option<u32>,
}

async fn candles_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let max_limit = state.config.read().max_page_limit;
    let limit = query.limit.unwrap_or(100).min(max_limit);

    match state.store.get_page(
        &query.provider,
        &query.symbol,
        query.interval,
        query.cursor,
        query.direction,
        limit,
    ) {
        Ok(page) => Json(page).into_response(),
        Err(e) => internal_error(format!("page query failed: {e}")).into_response(),
    }
}

#[derive(Deserialize)]
struct LatestQuery {
    symbol: String,
    interval: Interval,
}

async fn candles_latest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> impl IntoResponse {
    match state.store.get_latest(&query.symbol, query.interval) {
        Ok(Some(candle)) => Json(candle).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no candles stored for series" })),
        )
            .into_response(),
        Err(e) => internal_error(format!("latest query failed: {e}")).into_response(),
    }
}

#[derive(Deserialize)]
struct StatisticsQuery {
    #[serde(default)]
    detailed: bool,
}

async fn statistics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatisticsQuery>,
) -> impl IntoResponse {
    if query.detailed {
        match state.store.detailed_statistics() {
            Ok(stats) => Json(stats).into_response(),
            Err(e) => internal_error(format!("statistics failed: {e}")).into_response(),
        }
    } else {
        match state.store.statistics() {
            Ok(stats) => Json(stats).into_response(),
            Err(e) => internal_error(format!("statistics failed: {e}")).into_response(),
        }
    }
}

async fn candles_delete(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<DeleteFilter>,
) -> impl IntoResponse {
    // Reject before touching storage.
    if filter.is_empty() {
        return bad_request(
            "delete requires at least one of provider, symbol, interval".to_string(),
        )
        .into_response();
    }

    match state.store.delete(&filter) {
        Ok(deleted) => {
            info!(deleted, "candles deleted via API");
            Json(json!({ "deleted": deleted })).into_response()
        }
        Err(e) => internal_error(format!("delete failed: {e}")).into_response(),
    }
}

// =============================================================================
// Providers & configuration
// =============================================================================

async fn providers_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.provider_statuses())
}

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.read().clone())
}

/// Replace the declarative configuration, persist it atomically, and apply it
/// as a subscription diff. Per-provider failures come back in the response
/// rather than failing the whole apply.
async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(new_config): Json<crate::config::ServiceConfig>,
) -> impl IntoResponse {
    if let Err(e) = new_config.save(&state.config_path) {
        return internal_error(format!("failed to persist config: {e}")).into_response();
    }
    *state.config.write() = new_config;

    let failures = state.manager.apply_configuration().await;
    for failure in &failures {
        state
            .push_error(format!("{}: {}", failure.provider, failure.message));
    }
    Json(json!({ "applied": true, "failures": failures })).into_response()
}

async fn run_backfill(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackfillRequest>,
) -> impl IntoResponse {
    match state.manager.run_backfill(&request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            warn!(
                provider = %request.provider,
                symbol = %request.symbol,
                error = %e,
                "backfill request failed"
            );
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "success": false,
                    "provider": request.provider,
                    "symbol": request.symbol,
                    "interval": request.interval,
                    "error": format!("{e:#}"),
                })),
            )
                .into_response()
        }
    }
}

async fn recent_errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_errors.read().clone())
}

// =============================================================================
// Internal surface
// =============================================================================

#[derive(Deserialize)]
struct InternalCandlesQuery {
    symbol: String,
    interval: Interval,
    from: i64,
    to: i64,
}

/// Candle feed for the analytics service: `{ "candles": [...] }`.
async fn internal_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InternalCandlesQuery>,
) -> impl IntoResponse {
    match state
        .store
        .get_by_range(&query.symbol, query.interval, query.from, query.to)
    {
        Ok(candles) => Json(json!({ "candles": candles })).into_response(),
        Err(e) => internal_error(format!("range query failed: {e}")).into_response(),
    }
}

#[derive(Deserialize)]
struct PublishSignalsRequest {
    signals: Vec<Signal>,
}

/// Accept generated signals from the analytics service and fan them out to
/// matching `symbol:interval:strategy_id` subscribers.
async fn publish_signals(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PublishSignalsRequest>,
) -> impl IntoResponse {
    let mut delivered = 0;
    for signal in &request.signals {
        delivered += state.registry.publish_signal(signal);
    }
    Json(json!({ "accepted": request.signals.len(), "delivered": delivered }))
}
