//! WebSocket stream of push hints for one account.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::PushHub;

/// Router serving `GET /stream/delegate/{account}`.
pub fn stream_routes(hub: Arc<PushHub>) -> Router {
    Router::new()
        .route("/stream/delegate/{account}", get(stream_handler))
        .with_state(hub)
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    Path(account_id): Path<String>,
    State(hub): State<Arc<PushHub>>,
) -> impl IntoResponse {
    info!(account_id = %account_id, "Delegate stream connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, hub, account_id))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<PushHub>, account_id: String) {
    let mut rx = hub.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(envelope) => {
                        if envelope.account_id != account_id {
                            continue;
                        }
                        if let Ok(json) = serde_json::to_string(&envelope) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Delegate stream disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        // Hints only; the next poll picks up anything missed.
                        warn!(account_id = %account_id, missed = n, "Delegate stream lagged behind broadcast");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Push channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(account_id = %account_id, "Delegate stream disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Delegate stream error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
