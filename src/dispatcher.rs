// =============================================================================
// Dispatcher — provider events → store → fan-out
// =============================================================================
//
// The single consumer of the provider event channel. Every live candle is
// stored idempotently, then pushed to the subscribers of its
// `symbol:interval` key. Updates from a disconnected adapter or a stale
// generation are dropped on the floor: disconnecting a provider stops its
// delivery immediately, even if its old tasks still have events in flight.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::providers::{EventReceiver, ProviderEvent};

pub async fn run(state: Arc<AppState>, mut events: EventReceiver) {
    info!("dispatcher running");

    while let Some(event) = events.recv().await {
        match event {
            ProviderEvent::Candle { generation, candle } => {
                if !state.manager.is_live(&candle.provider, generation) {
                    debug!(
                        provider = %candle.provider,
                        generation,
                        "dropping update from stale provider incarnation"
                    );
                    continue;
                }

                // Storage trouble is surfaced, but live delivery continues:
                // subscribers should not go dark because a disk write failed.
                if let Err(e) = state.store.insert(&candle) {
                    error!(
                        provider = %candle.provider,
                        symbol = %candle.symbol,
                        error = %e,
                        "failed to store candle update"
                    );
                    state.push_error(format!("storage failure: {e}"));
                }

                let delivered = state.registry.publish_candle(&candle);
                debug!(
                    symbol = %candle.symbol,
                    interval = %candle.interval,
                    provider = %candle.provider,
                    delivered,
                    "candle update dispatched"
                );
            }

            ProviderEvent::Connectivity {
                provider,
                generation,
                connected,
            } => {
                info!(provider = %provider, connected, "provider connectivity changed");
                if !connected {
                    state
                        .manager
                        .clone()
                        .schedule_reconnect(&provider, generation);
                }
            }

            ProviderEvent::Error {
                provider, message, ..
            } => {
                warn!(provider = %provider, error = %message, "provider error");
                state.push_error(format!("{provider}: {message}"));
            }
        }
    }

    warn!("provider event channel closed — dispatcher exiting");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    use crate::config::{ProviderSettings, ServiceConfig};
    use crate::providers::sim::SimAdapter;
    use crate::providers::{event_channel, EventSender, ProviderAdapter, ProviderManager};
    use crate::sessions::{candle_key, SubscriptionRegistry};
    use crate::store::CandleStore;
    use crate::types::{Interval, OHLCVCandle};

    async fn connected_state() -> (Arc<AppState>, EventSender, Arc<dyn ProviderAdapter>) {
        let (tx, rx) = event_channel();

        let mut config = ServiceConfig::default();
        config.providers.clear();
        config.providers.insert(
            "sim".to_string(),
            ProviderSettings {
                enabled: true,
                symbols: vec![],
                intervals: vec![],
                backfill_on_startup: false,
            },
        );
        let config = Arc::new(RwLock::new(config));

        let store = Arc::new(CandleStore::open_in_memory().unwrap());
        let mut manager = ProviderManager::new(config.clone(), store.clone());
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(SimAdapter::new(tx.clone()));
        manager.register(adapter.clone());
        adapter.connect().await.unwrap();

        let state = Arc::new(AppState::new(
            config,
            PathBuf::from("candela.json"),
            store,
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(manager),
        ));
        tokio::spawn(run(state.clone(), rx));
        (state, tx, adapter)
    }

    fn candle(ts: i64) -> OHLCVCandle {
        OHLCVCandle {
            symbol: "SIM/USD".into(),
            interval: Interval::M1,
            timestamp: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 3.0,
            provider: "sim".into(),
        }
    }

    #[tokio::test]
    async fn candle_events_are_stored_and_fanned_out() {
        let (state, tx, adapter) = connected_state().await;

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let conn = state.registry.add_connection(client_tx);
        state
            .registry
            .subscribe_candles(conn, &candle_key("SIM/USD", Interval::M1));

        tx.send(ProviderEvent::Candle {
            generation: adapter.generation(),
            candle: candle(60_000),
        })
        .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.contains("candle_update"));
        assert!(msg.contains("SIM/USD"));

        let stored = state
            .store
            .get_by_range("SIM/USD", Interval::M1, 0, 120_000)
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn stale_generation_updates_are_dropped() {
        let (state, tx, adapter) = connected_state().await;

        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let conn = state.registry.add_connection(client_tx);
        state
            .registry
            .subscribe_candles(conn, &candle_key("SIM/USD", Interval::M1));

        // Stamp the event with a generation from a previous incarnation.
        tx.send(ProviderEvent::Candle {
            generation: adapter.generation() + 1,
            candle: candle(60_000),
        })
        .unwrap();
        // Then a current one so we can observe ordering.
        tx.send(ProviderEvent::Candle {
            generation: adapter.generation(),
            candle: candle(120_000),
        })
        .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.contains("120000"));

        let stored = state
            .store
            .get_by_range("SIM/USD", Interval::M1, 0, 180_000)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp, 120_000);
    }

    #[tokio::test]
    async fn updates_after_disconnect_are_dropped() {
        let (state, tx, adapter) = connected_state().await;
        let generation = adapter.generation();
        adapter.disconnect().await;

        tx.send(ProviderEvent::Candle {
            generation,
            candle: candle(60_000),
        })
        .unwrap();

        // Give the dispatcher a turn to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stored = state
            .store
            .get_by_range("SIM/USD", Interval::M1, 0, 120_000)
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn provider_errors_land_in_the_error_ring() {
        let (state, tx, _adapter) = connected_state().await;

        tx.send(ProviderEvent::Error {
            provider: "sim".into(),
            generation: 1,
            message: "stream torn".into(),
        })
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("stream torn"));
    }
}
