// =============================================================================
// Central Application State — Candela Market Data Service
// =============================================================================
//
// Ties the pipeline pieces together for the API layer and the dispatcher.
// Subsystems manage their own interior mutability behind Arc; the only state
// owned directly here is the recent-error ring surfaced on the dashboard
// endpoints.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::providers::ProviderManager;
use crate::sessions::SubscriptionRegistry;
use crate::store::CandleStore;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the operator error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Shared application state, held as `Arc<AppState>` by every task.
pub struct AppState {
    pub config: Arc<RwLock<ServiceConfig>>,
    pub config_path: PathBuf,
    pub store: Arc<CandleStore>,
    pub registry: Arc<SubscriptionRegistry>,
    pub manager: Arc<ProviderManager>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    /// Instant the service started, for uptime reporting.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Arc<RwLock<ServiceConfig>>,
        config_path: PathBuf,
        store: Arc<CandleStore>,
        registry: Arc<SubscriptionRegistry>,
        manager: Arc<ProviderManager>,
    ) -> Self {
        Self {
            config,
            config_path,
            store,
            registry,
            manager,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    /// Record an error message. The ring is capped at [`MAX_RECENT_ERRORS`];
    /// oldest entries are evicted when the limit is reached.
    pub fn push_error(&self, message: String) {
        let record = ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

// =============================================================================
// Tests
// =============================================================================
