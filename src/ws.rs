use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One session's lifetime: a writer task drains the hub's outbound channel so
/// pushed events (progress, broadcasts) never block on the reader loop, and
/// the reader loop enforces the ping/pong idle timeout.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    let span = tracing::info_span!("ws_session", %session_id);
    let _enter = span.enter();

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    state.hub.register(session_id, out_tx.clone());
    let _ = out_tx.send(state.router.system_status_value());

    let writer = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if sink.send(Message::Text(value.to_string())).await.is_err() {
                break;
            }
        }
    });

    let mut last_activity = Instant::now();
    let mut ping_ticker = tokio::time::interval(state.ws_ping_interval);

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        handle_text(&state, session_id, &text).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%session_id, error = %e, "websocket read error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = ping_ticker.tick() => {
                if last_activity.elapsed() > state.ws_idle_timeout {
                    warn!(%session_id, "closing idle websocket connection");
                    break;
                }
                let _ = state.hub.send_to(session_id, serde_json::json!({"type": "ping"}));
            }
        }
    }

    state.hub.unregister(session_id);
    state.router.on_disconnect(session_id).await;
    writer.abort();
    info!(%session_id, "websocket session closed");
}

/// Dispatch runs inline on the connection's own task rather than spawned, so
/// a job's `job:ack` is always enqueued to the outbound channel before the
/// execution thread can have produced its first progress event.
async fn handle_text(state: &AppState, session_id: Uuid, text: &str) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            let response = state.router.dispatch(session_id, value).await;
            state.hub.send_to(session_id, response);
        }
        Err(e) => {
            let _ = state.hub.send_to(
                session_id,
                serde_json::json!({"type": "error", "kind": "BadRequest", "message": e.to_string()}),
            );
        }
    }
}
