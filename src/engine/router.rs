// Routes decoded client frames to the game server.

use std::sync::Arc;

use crate::auth;
use crate::error::EngineError;

use super::protocol::{ClientMessage, GameActionKind, ServerMessage};
use super::registry::{ConnectionId, Identity};
use super::server::GameServer;

/// Decode one text frame and dispatch it.
pub async fn handle_text(server: &Arc<GameServer>, conn: ConnectionId, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => dispatch(server, conn, msg).await,
        Err(e) => {
            tracing::debug!(connection_id = conn, "Malformed client frame: {e}");
            server.send(
                conn,
                &ServerMessage::Error {
                    code: "INVALID_MESSAGE".to_string(),
                    message: format!("Invalid message: {e}"),
                },
            );
        }
    }
}

/// Apply one client message. Failures become a single ERROR frame to `conn`.
pub async fn dispatch(server: &Arc<GameServer>, conn: ConnectionId, msg: ClientMessage) {
    if msg.requires_auth() && server.identity(conn).is_none() {
        tracing::debug!(
            connection_id = conn,
            kind = msg.type_name(),
            "Dropping frame from unauthenticated connection"
        );
        server.send(
            conn,
            &ServerMessage::AuthRequired {
                message: "Authenticate before sending game messages".to_string(),
            },
        );
        return;
    }

    let result = match msg {
        ClientMessage::Authenticate { token } => match auth::verify_token(&token) {
            Ok(claims) => server.authenticate(
                conn,
                Identity {
                    user_id: claims.sub,
                    username: claims.username,
                },
            ),
            Err(e) => {
                tracing::debug!(connection_id = conn, "{e}");
                Err(EngineError::InvalidToken)
            }
        },
        ClientMessage::JoinGame { game_id } => server.join_room(conn, &game_id).await,
        ClientMessage::PlayerMove {
            direction,
            position,
        } => server.move_paddle(conn, direction, position),
        ClientMessage::GameAction { action } => {
            match action.game_id.or_else(|| server.room_of(conn)) {
                Some(room_id) => match action.kind {
                    GameActionKind::Ready => server.mark_ready(conn, &room_id).await,
                    GameActionKind::StartGame => server.start_game(&room_id, Some(conn)).await,
                    GameActionKind::PauseGame => server.pause(conn, &room_id),
                    GameActionKind::ResumeGame => server.resume(conn, &room_id),
                },
                None => Err(EngineError::NotInRoom),
            }
        }
        ClientMessage::PaddlePosition {
            room_id,
            player_number,
            paddle_y,
        } => server.set_paddle_position(conn, &room_id, player_number, paddle_y),
        ClientMessage::BallState {
            room_id,
            ball_state,
        } => server.relay_ball_state(conn, &room_id, ball_state),
        ClientMessage::ScoreUpdate { room_id, .. } => {
            // Scores come from the server's own simulation.
            tracing::debug!(
                connection_id = conn,
                room_id = %room_id,
                "Ignoring client score update"
            );
            Ok(())
        }
        ClientMessage::PlayerDisconnect {
            room_id, match_id, ..
        } => server.player_disconnect(conn, room_id, match_id).await,
        ClientMessage::Unknown => {
            tracing::debug!(connection_id = conn, "Ignoring unknown message type");
            Ok(())
        }
    };

    if let Err(e) = result {
        server.send_error(conn, &e);
    }
}
