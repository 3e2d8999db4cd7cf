// =============================================================================
// WebSocket Handler — backtest stream
// =============================================================================
//
// Clients connect to `/api/v1/backtest/stream` and receive every message the
// current timeline publishes (price, orderbook and candle events) as JSON
// text frames.  The subscription is bound to the timeline that exists at
// connect time; when it is finished or replaced the socket is closed.
//
// The handler also answers Ping frames and ignores any other client input.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::backtest::StreamMessage;

/// Upgrade to a WebSocket bound to the current backtest's stream.
pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(timeline) = state.backtest() else {
        return (StatusCode::NOT_FOUND, "no backtest has been created").into_response();
    };
    let id = timeline.id();
    let messages = timeline.subscribe();
    drop(timeline);

    ws.on_upgrade(move |socket| handle_stream_connection(socket, messages, id))
}

async fn handle_stream_connection(
    socket: WebSocket,
    mut messages: tokio::sync::broadcast::Receiver<StreamMessage>,
    id: uuid::Uuid,
) {
    info!(id = %id, "backtest stream client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            // ── Push: forward published messages ───────────────────────
            msg = messages.recv() => {
                match msg {
                    Ok(message) => {
                        let json = match serde_json::to_string(&message) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "failed to serialise stream message");
                                continue;
                            }
                        };
                        if let Err(e) = sender.send(Message::Text(json)).await {
                            debug!(error = %e, "stream send failed, disconnecting");
                            break;
                        }
                        sent += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(id = %id, skipped, "stream client lagging, messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        debug!(id = %id, "backtest stream closed");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // ── Recv: pings and close ───────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong, disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "stream receive error, disconnecting");
                        break;
                    }
                }
            }
        }
    }

    info!(id = %id, sent, "backtest stream client disconnected");
}
