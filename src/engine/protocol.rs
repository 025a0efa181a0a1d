// Wire protocol: JSON frames exchanged with game clients over the WebSocket.

use serde::{Deserialize, Deserializer, Serialize};

use super::physics::{Ball, StateSnapshot};

/// Room ids arrive either as strings or, for tournament matches, as bare numbers.
fn de_room_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

fn de_opt_room_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper(#[serde(deserialize_with = "de_room_id")] String);
    Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|w| w.0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameActionKind {
    Ready,
    StartGame,
    PauseGame,
    ResumeGame,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameAction {
    #[serde(rename = "type")]
    pub kind: GameActionKind,
    #[serde(default, deserialize_with = "de_opt_room_id")]
    pub game_id: Option<String>,
}

/// Frames sent by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    JoinGame {
        #[serde(deserialize_with = "de_room_id")]
        game_id: String,
    },
    PlayerMove {
        #[serde(default)]
        direction: Option<MoveDirection>,
        #[serde(default)]
        position: Option<f64>,
    },
    GameAction {
        action: GameAction,
    },
    PaddlePosition {
        #[serde(deserialize_with = "de_room_id")]
        room_id: String,
        player_number: u8,
        paddle_y: f64,
    },
    BallState {
        #[serde(deserialize_with = "de_room_id")]
        room_id: String,
        ball_state: serde_json::Value,
    },
    ScoreUpdate {
        #[serde(deserialize_with = "de_room_id")]
        room_id: String,
        scores: serde_json::Value,
    },
    PlayerDisconnect {
        #[serde(default, deserialize_with = "de_opt_room_id")]
        room_id: Option<String>,
        #[serde(default)]
        player_number: Option<u8>,
        #[serde(default)]
        tournament_id: Option<i64>,
        #[serde(default)]
        match_id: Option<i64>,
    },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    /// Everything except the handshake itself needs a bound identity.
    pub fn requires_auth(&self) -> bool {
        !matches!(
            self,
            ClientMessage::Authenticate { .. } | ClientMessage::Unknown
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate { .. } => "AUTHENTICATE",
            ClientMessage::JoinGame { .. } => "JOIN_GAME",
            ClientMessage::PlayerMove { .. } => "PLAYER_MOVE",
            ClientMessage::GameAction { .. } => "GAME_ACTION",
            ClientMessage::PaddlePosition { .. } => "PADDLE_POSITION",
            ClientMessage::BallState { .. } => "BALL_STATE",
            ClientMessage::ScoreUpdate { .. } => "SCORE_UPDATE",
            ClientMessage::PlayerDisconnect { .. } => "PLAYER_DISCONNECT",
            ClientMessage::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub user_id: i64,
    pub username: String,
    pub player_number: u8,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    AuthOk {
        user_id: i64,
        username: String,
    },
    AuthRequired {
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    PlayerJoined {
        room_id: String,
        players: Vec<PlayerInfo>,
    },
    PlayerReady {
        room_id: String,
        player_number: u8,
    },
    GameStarted {
        room_id: String,
        state: StateSnapshot,
    },
    GameStateUpdate {
        room_id: String,
        ball: Ball,
        paddles: [f64; 2],
        scores: [u32; 2],
    },
    ScoreUpdate {
        room_id: String,
        scores: [u32; 2],
        scorer: u8,
    },
    GamePaused {
        room_id: String,
        paused_by: i64,
    },
    GameResumed {
        room_id: String,
        resumed_by: i64,
        pause_duration_ms: u64,
    },
    GameEnded {
        room_id: String,
        winner: u8,
        winner_user_id: i64,
        final_scores: [u32; 2],
    },
    OpponentDisconnected {
        room_id: String,
        winner_user_id: i64,
        final_scores: [u32; 2],
        message: String,
    },
    BallState {
        room_id: String,
        ball_state: serde_json::Value,
    },
    RoomClosed {
        room_id: String,
        reason: String,
    },
    TournamentUpdated {
        tournament_id: i64,
        action: String,
    },
    TournamentStarted {
        tournament_id: i64,
    },
    UserStatus {
        user_id: i64,
        online: bool,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("Failed to serialize server message: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_with_string_and_numeric_ids() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"JOIN_GAME","gameId":"casual-abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinGame { ref game_id } if game_id == "casual-abc"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"JOIN_GAME","gameId":42}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinGame { ref game_id } if game_id == "42"));
    }

    #[test]
    fn test_parse_game_action() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"GAME_ACTION","action":{"type":"PAUSE_GAME","gameId":"7"}}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::GameAction { action } => {
                assert_eq!(action.kind, GameActionKind::PauseGame);
                assert_eq!(action.game_id.as_deref(), Some("7"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_paddle_and_move() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"PADDLE_POSITION","roomId":"r1","playerNumber":2,"paddleY":120.5}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::PaddlePosition { player_number: 2, paddle_y, .. } if paddle_y == 120.5
        ));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"PLAYER_MOVE","direction":"up"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::PlayerMove {
                direction: Some(MoveDirection::Up),
                position: None
            }
        ));
    }

    #[test]
    fn test_parse_disconnect_with_optional_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"PLAYER_DISCONNECT","roomId":12,"playerNumber":1,"tournamentId":3,"matchId":12}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::PlayerDisconnect {
                room_id,
                player_number,
                tournament_id,
                match_id,
            } => {
                assert_eq!(room_id.as_deref(), Some("12"));
                assert_eq!(player_number, Some(1));
                assert_eq!(tournament_id, Some(3));
                assert_eq!(match_id, Some(12));
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"PLAYER_DISCONNECT","roomId":"casual-1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PlayerDisconnect { match_id: None, .. }));
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"CHAT_MESSAGE","body":"hi"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
        assert!(!msg.requires_auth());
    }

    #[test]
    fn test_auth_requirements() {
        let auth: ClientMessage =
            serde_json::from_str(r#"{"type":"AUTHENTICATE","token":"t"}"#).unwrap();
        assert!(!auth.requires_auth());
        let join: ClientMessage =
            serde_json::from_str(r#"{"type":"JOIN_GAME","gameId":"x"}"#).unwrap();
        assert!(join.requires_auth());
    }

    #[test]
    fn test_server_message_serialization() {
        let msg = ServerMessage::GameEnded {
            room_id: "42".into(),
            winner: 1,
            winner_user_id: 7,
            final_scores: [5, 3],
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"GAME_ENDED\""));
        assert!(json.contains("\"winnerUserId\":7"));
        assert!(json.contains("\"finalScores\":[5,3]"));

        let msg = ServerMessage::TournamentUpdated {
            tournament_id: 3,
            action: "match_completed".into(),
        };
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"TOURNAMENT_UPDATED\""));
        assert!(json.contains("\"tournamentId\":3"));
    }
}
