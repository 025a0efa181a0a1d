// WebSocket handler: one task per client, bridging the socket and the game server.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use tokio::sync::mpsc;

use crate::engine::router;

use super::AppState;

/// WebSocket upgrade handler for game clients.
pub async fn ws_game(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let server = state.game_server;
    let conn = server.connect(tx);

    loop {
        tokio::select! {
            // Outbound frame queued by the game server
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    break;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    // Client disconnected
                    break;
                }
            }
            // Client frame
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        router::handle_text(&server, conn, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = conn, "WebSocket error: {e}");
                        break;
                    }
                    _ => {
                        // Ping/pong and binary frames are ignored
                    }
                }
            }
        }
    }

    server.disconnect(conn);
}
