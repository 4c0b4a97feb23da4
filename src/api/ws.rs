// =============================================================================
// WebSocket Handler — push-based status updates and live bus events
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate full StatusSnapshot on connect.
//   2. A fresh snapshot every 500 ms whenever the state version changed.
//   3. Every bus event (NEWS_*, TRADE_EXECUTED, ...) as it is published.
//
// Ping frames are answered with Pong; the connection cleans up on close.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade; token-gated via query parameter.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "Invalid or missing token").into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

/// One connection: push loop + bus forwarding + client receive loop.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut bus_rx = state.bus.subscribe();
    let mut push_interval = interval(Duration::from_millis(500));
    let mut last_sent_version: u64 = 0;

    // Initial snapshot.
    if send_snapshot(&mut sender, &state).await.is_err() {
        warn!("failed to send initial WebSocket snapshot");
        return;
    }
    last_sent_version = state.current_state_version();

    loop {
        tokio::select! {
            // ── Push loop: snapshot on version change ───────────────────
            _ = push_interval.tick() => {
                let current = state.current_state_version();
                if current != last_sent_version {
                    if send_snapshot(&mut sender, &state).await.is_err() {
                        debug!("WebSocket snapshot send failed — disconnecting");
                        break;
                    }
                    last_sent_version = current;
                }
            }

            // ── Bus events forwarded live ───────────────────────────────
            event = bus_rx.recv() => {
                match event {
                    Ok(event) => {
                        let payload = serde_json::json!({
                            "kind": "event",
                            "channel": event.channel.to_string(),
                            "payload": event.payload,
                            "at": event.at,
                        });
                        if let Ok(json) = serde_json::to_string(&payload) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "WebSocket subscriber lagged bus events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(msg = %text, "WebSocket text message (heartbeat)");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    info!("WebSocket connection cleanup complete");
}

/// Serialize and send the current status snapshot.
async fn send_snapshot<S>(sender: &mut S, state: &Arc<AppState>) -> Result<(), ()>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    let snapshot = state.build_status_snapshot().await;
    let payload = serde_json::json!({ "kind": "snapshot", "data": snapshot });
    match serde_json::to_string(&payload) {
        Ok(json) => sender
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| ()),
        Err(e) => {
            // Serialisation errors are not connection errors.
            warn!(error = %e, "failed to serialize status snapshot");
            Ok(())
        }
    }
}
