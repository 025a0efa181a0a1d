// Error types for the match engine and the HTTP surface.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Rejections produced by the lifecycle controller. Each one becomes a single
/// ERROR frame to the connection that caused it.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("authenticate first")]
    AuthRequired,
    #[error("invalid token")]
    InvalidToken,
    #[error("room `{0}` does not exist")]
    UnknownRoom(String),
    #[error("tournament match {0} does not exist")]
    UnknownMatch(i64),
    #[error("match already completed")]
    MatchCompleted,
    #[error("match already in progress")]
    InProgress,
    #[error("room is full")]
    RoomFull,
    #[error("you are not a player in this match")]
    NotParticipant,
    #[error("both players must accept the match first")]
    NotAccepted,
    #[error("you are not in this room")]
    NotInRoom,
    #[error("match is not running")]
    NotRunning,
    #[error("waiting for an opponent")]
    WaitingForOpponent,
    #[error("leave the room before switching accounts")]
    IdentityLocked,
    #[error("storage error")]
    Storage(#[from] sqlx::Error),
}

impl EngineError {
    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::AuthRequired => "AUTH_REQUIRED",
            EngineError::InvalidToken => "INVALID_TOKEN",
            EngineError::UnknownRoom(_) => "UNKNOWN_ROOM",
            EngineError::UnknownMatch(_) => "UNKNOWN_MATCH",
            EngineError::MatchCompleted => "MATCH_COMPLETED",
            EngineError::InProgress => "IN_PROGRESS",
            EngineError::RoomFull => "ROOM_FULL",
            EngineError::NotParticipant => "NOT_PARTICIPANT",
            EngineError::NotAccepted => "NOT_ACCEPTED",
            EngineError::NotInRoom => "NOT_IN_ROOM",
            EngineError::NotRunning => "NOT_RUNNING",
            EngineError::WaitingForOpponent => "WAITING_FOR_OPPONENT",
            EngineError::IdentityLocked => "IDENTITY_LOCKED",
            EngineError::Storage(_) => "INTERNAL",
        }
    }
}

/// Errors returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Database error: {e}");
        ApiError::Internal
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::AuthRequired | EngineError::InvalidToken => {
                ApiError::Unauthorized(e.to_string())
            }
            EngineError::UnknownRoom(_) | EngineError::UnknownMatch(_) => {
                ApiError::NotFound(e.to_string())
            }
            EngineError::NotParticipant | EngineError::NotInRoom => {
                ApiError::Forbidden(e.to_string())
            }
            EngineError::Storage(source) => source.into(),
            other => ApiError::Conflict(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_codes() {
        assert_eq!(EngineError::AuthRequired.code(), "AUTH_REQUIRED");
        assert_eq!(EngineError::MatchCompleted.code(), "MATCH_COMPLETED");
        assert_eq!(
            EngineError::UnknownRoom("x".into()).to_string(),
            "room `x` does not exist"
        );
    }

    #[test]
    fn test_api_error_status() {
        let resp = ApiError::from(EngineError::NotAccepted).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let resp = ApiError::from(EngineError::UnknownMatch(3)).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError::from(sqlx::Error::RowNotFound).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
