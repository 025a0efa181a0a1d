// HTTP API routes: tournaments, bracket acceptance, casual invites, match history.

pub mod ws;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::auth::AuthUser;
use crate::db::{Database, MatchStatus, TournamentStatus};
use crate::engine::protocol::ServerMessage;
use crate::engine::server::GameServer;
use crate::error::ApiError;
use crate::metrics;
use crate::tournament;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTournamentRequest {
    pub name: String,
    pub max_players: Option<i64>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

const DEFAULT_MAX_PLAYERS: i64 = 8;
const MAX_PLAYERS_LIMIT: i64 = 64;

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub game_server: Arc<GameServer>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(db: Arc<Database>, game_server: Arc<GameServer>) -> Router {
    let state = AppState { db, game_server };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        // Tournaments
        .route(
            "/api/tournaments",
            get(list_tournaments).post(create_tournament),
        )
        .route(
            "/api/tournaments/{id}",
            get(get_tournament).delete(delete_tournament),
        )
        .route("/api/tournaments/{id}/join", post(join_tournament))
        .route("/api/tournaments/{id}/start", post(start_tournament))
        .route("/api/tournaments/{id}/matches", get(list_matches))
        .route(
            "/api/tournaments/{id}/matches/{match_id}/accept",
            post(accept_match),
        )
        // Casual games
        .route("/api/games", post(create_game))
        .route("/api/users/{id}/games", get(list_user_games))
        // WebSocket
        .route("/ws/game", get(ws::ws_game))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Tournament handlers ───────────────────────────────────────────────

async fn list_tournaments(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let tournaments = state.db.list_tournaments().await?;
    Ok(Json(json!(tournaments)))
}

async fn create_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateTournamentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let max_players = req.max_players.unwrap_or(DEFAULT_MAX_PLAYERS);
    if !(2..=MAX_PLAYERS_LIMIT).contains(&max_players) {
        return Err(ApiError::BadRequest(format!(
            "maxPlayers must be between 2 and {MAX_PLAYERS_LIMIT}"
        )));
    }

    let tournament = state
        .db
        .create_tournament(name, max_players, auth.0.sub)
        .await?;
    state.db.add_participant(tournament.id, auth.0.sub).await?;
    tracing::info!(
        tournament_id = tournament.id,
        creator_id = auth.0.sub,
        "Tournament created"
    );
    Ok((StatusCode::CREATED, Json(json!(tournament))))
}

async fn get_tournament(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tournament = state
        .db
        .get_tournament(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Tournament not found".to_string()))?;
    let participants = state.db.list_participants(id).await?;
    let matches = state.db.list_tournament_matches(id).await?;
    Ok(Json(json!({
        "tournament": tournament,
        "participants": participants,
        "matches": matches,
    })))
}

async fn delete_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tournament = state
        .db
        .get_tournament(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Tournament not found".to_string()))?;
    if tournament.creator_id != auth.0.sub {
        return Err(ApiError::Forbidden(
            "Only the creator can delete a tournament".to_string(),
        ));
    }

    let match_ids: Vec<i64> = state
        .db
        .list_tournament_matches(id)
        .await?
        .iter()
        .map(|m| m.id)
        .collect();
    state.game_server.close_tournament_rooms(&match_ids);
    state.db.delete_tournament(id).await?;
    state.game_server.broadcast(&ServerMessage::TournamentUpdated {
        tournament_id: id,
        action: "tournament_deleted".to_string(),
    });
    tracing::info!(tournament_id = id, "Tournament deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn join_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tournament = state
        .db
        .get_tournament(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Tournament not found".to_string()))?;
    if tournament.status() != Some(TournamentStatus::Waiting) {
        return Err(ApiError::Conflict(
            "Tournament is no longer accepting players".to_string(),
        ));
    }
    let participants = state.db.list_participants(id).await?;
    if participants.len() as i64 >= tournament.max_players {
        return Err(ApiError::Conflict("Tournament is full".to_string()));
    }
    if participants.iter().any(|p| p.user_id == auth.0.sub) {
        return Err(ApiError::Conflict("Already joined".to_string()));
    }
    if !state.db.add_participant(id, auth.0.sub).await? {
        // Lost a race with a start or another join.
        return Err(ApiError::Conflict(
            "Tournament is no longer accepting players".to_string(),
        ));
    }

    state.game_server.broadcast(&ServerMessage::TournamentUpdated {
        tournament_id: id,
        action: "player_joined".to_string(),
    });
    let participants = state.db.list_participants(id).await?;
    Ok(Json(json!(participants)))
}

async fn start_tournament(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tournament = state
        .db
        .get_tournament(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Tournament not found".to_string()))?;
    if tournament.creator_id != auth.0.sub {
        return Err(ApiError::Forbidden(
            "Only the creator can start a tournament".to_string(),
        ));
    }
    if state.db.list_participants(id).await?.len() < 2 {
        return Err(ApiError::BadRequest(
            "At least 2 participants are required".to_string(),
        ));
    }
    if !state.db.start_tournament(id).await? {
        return Err(ApiError::Conflict("Tournament already started".to_string()));
    }

    // The roster is frozen once the status flips; seed from what it holds now.
    let participants: Vec<i64> = state
        .db
        .list_participants(id)
        .await?
        .iter()
        .map(|p| p.user_id)
        .collect();
    let matches = tournament::seed_bracket(&state.db, id, &participants).await?;
    state
        .game_server
        .broadcast(&ServerMessage::TournamentStarted { tournament_id: id });
    tracing::info!(tournament_id = id, matches = matches.len(), "Tournament started");
    Ok(Json(json!(matches)))
}

async fn list_matches(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.db.get_tournament(id).await?.is_none() {
        return Err(ApiError::NotFound("Tournament not found".to_string()));
    }
    let matches = state.db.list_tournament_matches(id).await?;
    Ok(Json(json!(matches)))
}

async fn accept_match(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((id, match_id)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    let m = state
        .db
        .get_tournament_match(match_id)
        .await?
        .filter(|m| m.tournament_id == id)
        .ok_or_else(|| ApiError::NotFound("Match not found".to_string()))?;
    let slot = m
        .slot_of(auth.0.sub)
        .ok_or_else(|| ApiError::Forbidden("You are not a player in this match".to_string()))?;

    match m.status() {
        Some(MatchStatus::Ready) => {}
        Some(MatchStatus::Accepted) | Some(MatchStatus::InProgress) => {
            return Ok(Json(json!(m)));
        }
        _ => {
            return Err(ApiError::Conflict(
                "Match is not waiting for acceptance".to_string(),
            ))
        }
    }

    state.db.accept_match(match_id, slot).await?;
    if state.db.promote_accepted(match_id).await? {
        tracing::info!(tournament_id = id, match_id, "Match accepted by both players");
        state.game_server.broadcast(&ServerMessage::TournamentUpdated {
            tournament_id: id,
            action: "match_accepted".to_string(),
        });
    }

    let updated = state
        .db
        .get_tournament_match(match_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Match not found".to_string()))?;
    Ok(Json(json!(updated)))
}

// ── Casual games and history ──────────────────────────────────────────

async fn create_game(_auth: AuthUser) -> impl IntoResponse {
    let room_id = format!("casual-{}", uuid::Uuid::new_v4());
    (StatusCode::CREATED, Json(json!({ "roomId": room_id })))
}

async fn list_user_games(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let games = state.db.list_games_for_user(user_id, limit).await?;
    Ok(Json(json!(games)))
}
