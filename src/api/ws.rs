// =============================================================================
// WebSocket Handler — live candle/signal fan-out per subscription
// =============================================================================
//
// Clients connect to `/api/v1/ws` and drive their subscriptions with
// `subscribe_candles` / `unsubscribe_candles` (and the signal equivalents).
// Matching `candle_update` / `signal_update` payloads are pushed until the
// client unsubscribes or disconnects.
//
// Each connection owns an unbounded channel registered with the
// SubscriptionRegistry; the dispatcher never blocks on a slow client. The
// handler also:
//   - Responds to Ping frames with Pong frames.
//   - Logs and ignores malformed client messages without dropping the
//     connection.
//   - Cleans the registry up on disconnect.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::sessions::{candle_key, signal_key, ConnectionId};
use crate::types::Interval;

// =============================================================================
// Client messages
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeCandles {
        symbol: String,
        interval: Interval,
    },
    UnsubscribeCandles {
        symbol: String,
        interval: Interval,
    },
    SubscribeSignals {
        symbol: String,
        interval: Interval,
        strategy_id: String,
    },
    UnsubscribeSignals {
        symbol: String,
        interval: Interval,
        strategy_id: String,
    },
    Ping,
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle.
///
/// Two concurrent flows via `tokio::select!`:
///   1. **Push** — updates queued by the dispatcher on this connection's
///      channel are forwarded to the socket.
///   2. **Recv** — client subscription messages mutate the registry.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let reply_tx = tx.clone();
    let conn_id = state.registry.add_connection(tx);
    info!(connection = %conn_id, "WebSocket client connected");

    loop {
        tokio::select! {
            // ── Push: registry-fanned updates and local replies ──────────
            update = rx.recv() => {
                match update {
                    Some(json) => {
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(connection = %conn_id, error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    None => break,
                }
            }

            // ── Recv: client subscription messages ──────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, conn_id, &text, &reply_tx);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(connection = %conn_id, error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        debug!(connection = %conn_id, "WebSocket Pong received");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(connection = %conn_id, "WebSocket Close frame received");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(connection = %conn_id, "WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(connection = %conn_id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!(connection = %conn_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.registry.remove_connection(conn_id);
    info!(connection = %conn_id, "WebSocket client disconnected — registry cleaned up");
}

/// Apply one inbound client message to the registry. Malformed messages are
/// logged and ignored; they never terminate the connection or touch other
/// connections' subscriptions.
fn handle_client_message(
    state: &Arc<AppState>,
    conn_id: ConnectionId,
    text: &str,
    reply_tx: &mpsc::UnboundedSender<String>,
) {
    let parsed: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(connection = %conn_id, error = %e, "ignoring malformed client message");
            return;
        }
    };

    let reply = match parsed {
        ClientMessage::SubscribeCandles { symbol, interval } => {
            let key = candle_key(&symbol, interval);
            state.registry.subscribe_candles(conn_id, &key);
            ack("subscribed", &key)
        }
        ClientMessage::UnsubscribeCandles { symbol, interval } => {
            let key = candle_key(&symbol, interval);
            state.registry.unsubscribe_candles(conn_id, &key);
            ack("unsubscribed", &key)
        }
        ClientMessage::SubscribeSignals {
            symbol,
            interval,
            strategy_id,
        } => {
            let key = signal_key(&symbol, interval, &strategy_id);
            state.registry.subscribe_signals(conn_id, &key);
            ack("subscribed", &key)
        }
        ClientMessage::UnsubscribeSignals {
            symbol,
            interval,
            strategy_id,
        } => {
            let key = signal_key(&symbol, interval, &strategy_id);
            state.registry.unsubscribe_signals(conn_id, &key);
            ack("unsubscribed", &key)
        }
        ClientMessage::Ping => serde_json::json!({ "type": "pong" }).to_string(),
    };

    // Replies ride the same channel as fan-out, keeping one ordered send path.
    let _ = reply_tx.send(reply);
}

fn ack(kind: &str, key: &str) -> String {
    serde_json::json!({ "type": kind, "key": key }).to_string()
}

// =============================================================================
// Tests
// =============================================================================
