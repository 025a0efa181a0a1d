// Game server: owns live connections and rooms, drives per-room tick tasks and
// persists match results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::db::{Database, MatchSlot, MatchStatus, NewGame};
use crate::error::EngineError;
use crate::metrics;
use crate::tournament::{self, Advancement};

use super::config::GameConfig;
use super::physics::{Side, StepEvent};
use super::protocol::{MoveDirection, ServerMessage};
use super::registry::{ConnectionId, ConnectionRegistry, Identity, Outbound, Presence};
use super::rooms::{Occupant, Room, RoomKind, RoomStore, TournamentLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Win,
    Forfeit,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Win => "win",
            EndReason::Forfeit => "forfeit",
        }
    }
}

/// Emitted once per finished match for stats and points collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCompleted {
    pub room_id: String,
    pub kind: RoomKind,
    pub tournament_id: Option<i64>,
    /// Player 1 and player 2 user ids.
    pub player_ids: [i64; 2],
    pub winner_id: i64,
    pub loser_id: i64,
    /// Player 1 and player 2 scores.
    pub scores: [u32; 2],
    pub reason: EndReason,
}

/// Read-only view of a room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomStatus {
    pub occupants: usize,
    pub started: bool,
    pub paused: bool,
    pub finished: bool,
    pub scores: [u32; 2],
    pub ticking: bool,
}

enum TickOutcome {
    Continue,
    Stop,
    Finished(Option<MatchCompleted>),
}

struct Inner {
    connections: ConnectionRegistry,
    rooms: RoomStore,
}

/// Match lifecycle controller. The only component that starts or stops a
/// room's tick task.
pub struct GameServer {
    inner: Mutex<Inner>,
    db: Arc<Database>,
    config: GameConfig,
    completions: broadcast::Sender<MatchCompleted>,
    next_connection_id: AtomicU64,
}

impl GameServer {
    pub fn new(db: Arc<Database>, config: GameConfig) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Inner {
                connections: ConnectionRegistry::new(),
                rooms: RoomStore::new(),
            }),
            db,
            config,
            completions: tx,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Never held across an await.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Subscribe to finished-match events.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<MatchCompleted> {
        self.completions.subscribe()
    }

    // ── Connections ──────────────────────────────────────────────────

    pub fn connect(&self, tx: Outbound) -> ConnectionId {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.lock().connections.register(id, tx);
        tracing::debug!(connection_id = id, "Connection opened");
        id
    }

    /// Bind a verified identity to a connection and announce presence changes.
    /// A seated connection keeps its user until it leaves the room.
    pub fn authenticate(
        &self,
        conn: ConnectionId,
        identity: Identity,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let user_id = identity.user_id;
        let switching = inner
            .connections
            .identity(conn)
            .is_some_and(|current| current.user_id != user_id);
        if switching && inner.connections.room_of(conn).is_some() {
            return Err(EngineError::IdentityLocked);
        }
        let username = identity.username.clone();
        let changes = inner.connections.authenticate(conn, identity);
        inner
            .connections
            .send(conn, &ServerMessage::AuthOk { user_id, username });
        for change in changes {
            let (user_id, online) = match change {
                Presence::CameOnline(id) => (id, true),
                Presence::WentOffline(id) => (id, false),
            };
            inner.connections.broadcast_authenticated(
                &ServerMessage::UserStatus { user_id, online },
                Some(conn),
            );
        }
        tracing::info!(connection_id = conn, user_id, "Connection authenticated");
        Ok(())
    }

    /// Transport closed. Forfeits a live match only if this was the user's
    /// last connection.
    pub fn disconnect(self: &Arc<Self>, conn: ConnectionId) {
        let (room_id, last_connection) = {
            let mut inner = self.lock();
            let room_id = inner.connections.room_of(conn).map(str::to_string);
            let Some((closed, presence)) = inner.connections.unregister(conn) else {
                return;
            };
            if let Some(Presence::WentOffline(user_id)) = presence {
                inner.connections.broadcast_authenticated(
                    &ServerMessage::UserStatus {
                        user_id,
                        online: false,
                    },
                    None,
                );
            }
            let last = closed
                .identity
                .as_ref()
                .is_some_and(|i| !inner.connections.is_online(i.user_id));
            (room_id, last)
        };
        tracing::debug!(connection_id = conn, "Connection closed");

        if let Some(room_id) = room_id {
            if let Some(outcome) = self.leave_room(conn, &room_id, last_connection) {
                self.spawn_finalize(outcome);
            }
        }
    }

    pub fn identity(&self, conn: ConnectionId) -> Option<Identity> {
        self.lock().connections.identity(conn).cloned()
    }

    pub fn room_of(&self, conn: ConnectionId) -> Option<String> {
        self.lock().connections.room_of(conn).map(str::to_string)
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.lock().connections.is_online(user_id)
    }

    pub fn send(&self, conn: ConnectionId, msg: &ServerMessage) {
        self.lock().connections.send(conn, msg);
    }

    /// Single error frame to the offending connection.
    pub fn send_error(&self, conn: ConnectionId, err: &EngineError) {
        match err {
            EngineError::Storage(e) => tracing::error!(connection_id = conn, "Database error: {e}"),
            other => tracing::debug!(connection_id = conn, "Rejected action: {other}"),
        }
        self.send(
            conn,
            &ServerMessage::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            },
        );
    }

    /// Send to every authenticated connection.
    pub fn broadcast(&self, msg: &ServerMessage) {
        self.lock().connections.broadcast_authenticated(msg, None);
    }

    // ── Rooms ────────────────────────────────────────────────────────

    pub fn room_status(&self, room_id: &str) -> Option<RoomStatus> {
        let inner = self.lock();
        let room = inner.rooms.get(room_id)?;
        Some(RoomStatus {
            occupants: room.occupant_count(),
            started: room.state.started,
            paused: room.state.paused,
            finished: room.state.finished,
            scores: room.state.scores,
            ticking: room.has_tick(),
        })
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub async fn join_room(
        self: &Arc<Self>,
        conn: ConnectionId,
        room_id: &str,
    ) -> Result<(), EngineError> {
        let identity = self.identity(conn).ok_or(EngineError::AuthRequired)?;

        let link = match RoomKind::from_room_id(room_id) {
            RoomKind::Tournament { match_id } => {
                let m = self
                    .db
                    .get_tournament_match(match_id)
                    .await?
                    .ok_or(EngineError::UnknownMatch(match_id))?;
                if m.is_completed() {
                    return Err(EngineError::MatchCompleted);
                }
                if m.slot_of(identity.user_id).is_none() {
                    return Err(EngineError::NotParticipant);
                }
                Some(TournamentLink {
                    tournament_id: m.tournament_id,
                    players: [m.player1_id, m.player2_id],
                })
            }
            RoomKind::Casual => None,
        };

        let previous = self.room_of(conn).filter(|r| r != room_id);
        if let Some(previous) = previous {
            if let Some(outcome) = self.leave_room(conn, &previous, true) {
                self.spawn_finalize(outcome);
            }
        }

        let schedule_start = {
            let mut inner = self.lock();
            let result = self.seat(&mut inner, conn, room_id, &identity, link);
            if result.is_err() {
                let abandoned = inner
                    .rooms
                    .get(room_id)
                    .is_some_and(|r| r.occupant_count() == 0 && !r.state.started);
                if abandoned {
                    inner.rooms.delete(room_id);
                }
            }
            result?
        };

        if schedule_start {
            self.schedule_auto_start(room_id);
        }
        Ok(())
    }

    /// Place a connection in a room. Returns true if an auto-start should be scheduled.
    fn seat(
        &self,
        inner: &mut Inner,
        conn: ConnectionId,
        room_id: &str,
        identity: &Identity,
        link: Option<TournamentLink>,
    ) -> Result<bool, EngineError> {
        let Inner { connections, rooms } = inner;
        let room = rooms.get_or_create(room_id, &self.config);
        if room.state.finished {
            return Err(EngineError::MatchCompleted);
        }
        if room.tournament.is_none() {
            room.tournament = link;
        }

        if room.side_of_connection(conn).is_none() {
            let side = match room.seat_for(identity.user_id) {
                Some(side) => side,
                None if room.state.is_live() => return Err(EngineError::InProgress),
                None => return Err(EngineError::RoomFull),
            };
            if let Some(existing) = room.slots[side.index()].take() {
                // Same user from another tab takes the seat over.
                connections.clear_room_if(existing.connection_id, room_id);
            }
            room.slots[side.index()] = Some(Occupant {
                connection_id: conn,
                ready: false,
            });
            room.roster[side.index()] = Some(identity.clone());
            connections.set_room(conn, Some(room_id.to_string()));
            tracing::info!(
                room_id,
                user_id = identity.user_id,
                player = side.player_number(),
                "Player joined room"
            );
        }

        connections.send_many(
            room.connection_ids(),
            &ServerMessage::PlayerJoined {
                room_id: room_id.to_string(),
                players: room.players(),
            },
        );
        if room.state.is_live() {
            connections.send(
                conn,
                &ServerMessage::GameStarted {
                    room_id: room_id.to_string(),
                    state: room.state.snapshot(),
                },
            );
        }

        let schedule =
            room.occupant_count() == 2 && !room.state.started && !room.auto_start_pending;
        if schedule {
            room.auto_start_pending = true;
        }
        Ok(schedule)
    }

    fn schedule_auto_start(self: &Arc<Self>, room_id: &str) {
        let server = Arc::downgrade(self);
        let room_id = room_id.to_string();
        let delay = self.config.auto_start_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(server) = server.upgrade() else {
                return;
            };
            {
                let mut inner = server.lock();
                if let Some(room) = inner.rooms.get_mut(&room_id) {
                    room.auto_start_pending = false;
                }
            }
            if let Err(e) = server.start_game(&room_id, None).await {
                tracing::debug!(room_id = %room_id, "Auto-start skipped: {e}");
            }
        });
    }

    /// Remove a connection from a room. With `forfeit`, a live match is
    /// awarded to the remaining occupant.
    fn leave_room(
        self: &Arc<Self>,
        conn: ConnectionId,
        room_id: &str,
        forfeit: bool,
    ) -> Option<MatchCompleted> {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        connections.clear_room_if(conn, room_id);
        let room = rooms.get_mut(room_id)?;
        let side = room.side_of_connection(conn)?;
        room.slots[side.index()] = None;
        tracing::info!(room_id, connection_id = conn, forfeit, "Player left room");

        let mut outcome = None;
        if room.state.is_live() {
            let opponent = side.opponent();
            if forfeit && room.slots[opponent.index()].is_some() {
                room.state.finished = true;
                room.state.scores[opponent.index()] = self.config.win_score;
                room.state.scores[side.index()] = 0;
                outcome = self.conclude(room, connections, opponent, EndReason::Forfeit);
            } else if room.occupant_count() == 0 {
                // Nobody left to play; hold the match until someone rejoins.
                room.state.pause(Instant::now());
                room.cancel_tick();
            }
        } else if !room.state.started {
            room.roster[side.index()] = None;
            for occupant in room.slots.iter_mut().flatten() {
                occupant.ready = false;
            }
            connections.send_many(
                room.connection_ids(),
                &ServerMessage::PlayerJoined {
                    room_id: room_id.to_string(),
                    players: room.players(),
                },
            );
        }

        if room.occupant_count() == 0 && !room.state.is_live() {
            rooms.delete(room_id);
        }
        outcome
    }

    // ── Lifecycle actions ────────────────────────────────────────────

    /// Start a room's match. Safe to race between auto-start and explicit starts:
    /// only the first caller spawns the tick task.
    pub async fn start_game(
        self: &Arc<Self>,
        room_id: &str,
        requested_by: Option<ConnectionId>,
    ) -> Result<(), EngineError> {
        let kind = {
            let inner = self.lock();
            let room = inner
                .rooms
                .get(room_id)
                .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
            if let Some(conn) = requested_by {
                room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
            }
            if room.state.finished {
                return Err(EngineError::MatchCompleted);
            }
            if room.state.started {
                return Ok(());
            }
            if room.occupant_count() < 2 {
                return Err(EngineError::WaitingForOpponent);
            }
            room.kind
        };

        if let RoomKind::Tournament { match_id } = kind {
            self.claim_tournament_match(match_id).await?;
        }

        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        if room.state.finished {
            return Err(EngineError::MatchCompleted);
        }
        if room.state.started {
            return Ok(());
        }
        if room.occupant_count() < 2 {
            return Err(EngineError::WaitingForOpponent);
        }

        room.state
            .start(&self.config, &mut rand::thread_rng(), Instant::now());
        metrics::GAMES_STARTED_TOTAL
            .with_label_values(&[kind.label()])
            .inc();
        connections.send_many(
            room.connection_ids(),
            &ServerMessage::GameStarted {
                room_id: room_id.to_string(),
                state: room.state.snapshot(),
            },
        );
        if !room.has_tick() {
            let handle = self.spawn_tick(room_id);
            room.set_tick(handle);
        }
        tracing::info!(room_id, kind = kind.label(), "Game started");
        Ok(())
    }

    /// Require a persisted match to be accepted (or already running) and move it to in_progress.
    async fn claim_tournament_match(&self, match_id: i64) -> Result<(), EngineError> {
        let m = self
            .db
            .get_tournament_match(match_id)
            .await?
            .ok_or(EngineError::UnknownMatch(match_id))?;
        match m.status() {
            Some(MatchStatus::Accepted) => {
                if !self.db.mark_match_in_progress(match_id).await? {
                    let current = self.db.get_tournament_match(match_id).await?;
                    if current.is_some_and(|m| m.is_completed()) {
                        return Err(EngineError::MatchCompleted);
                    }
                }
                Ok(())
            }
            Some(MatchStatus::InProgress) => Ok(()),
            Some(MatchStatus::Completed) => Err(EngineError::MatchCompleted),
            _ => Err(EngineError::NotAccepted),
        }
    }

    /// READY from one occupant. Starts the match once both are ready.
    pub async fn mark_ready(
        self: &Arc<Self>,
        conn: ConnectionId,
        room_id: &str,
    ) -> Result<(), EngineError> {
        let all_ready = {
            let mut inner = self.lock();
            let Inner { connections, rooms } = &mut *inner;
            let room = rooms
                .get_mut(room_id)
                .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
            let side = room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
            if room.state.started {
                return Ok(());
            }
            if let Some(occupant) = room.slots[side.index()].as_mut() {
                occupant.ready = true;
            }
            connections.send_many(
                room.connection_ids(),
                &ServerMessage::PlayerReady {
                    room_id: room_id.to_string(),
                    player_number: side.player_number(),
                },
            );
            room.all_ready()
        };

        if all_ready {
            self.start_game(room_id, Some(conn)).await
        } else {
            Ok(())
        }
    }

    pub fn pause(&self, conn: ConnectionId, room_id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        let side = room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
        if !room.state.pause(Instant::now()) {
            return Err(EngineError::NotRunning);
        }
        let paused_by = room.user_id(side).unwrap_or_default();
        connections.send_many(
            room.connection_ids(),
            &ServerMessage::GamePaused {
                room_id: room_id.to_string(),
                paused_by,
            },
        );
        tracing::info!(room_id, paused_by, "Game paused");
        Ok(())
    }

    pub fn resume(self: &Arc<Self>, conn: ConnectionId, room_id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        let side = room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
        let paused_for = room
            .state
            .resume(Instant::now())
            .ok_or(EngineError::NotRunning)?;
        if !room.has_tick() {
            let handle = self.spawn_tick(room_id);
            room.set_tick(handle);
        }
        let resumed_by = room.user_id(side).unwrap_or_default();
        connections.send_many(
            room.connection_ids(),
            &ServerMessage::GameResumed {
                room_id: room_id.to_string(),
                resumed_by,
                pause_duration_ms: paused_for.as_millis() as u64,
            },
        );
        tracing::info!(room_id, resumed_by, "Game resumed");
        Ok(())
    }

    /// PLAYER_MOVE: absolute position wins over a direction step.
    pub fn move_paddle(
        &self,
        conn: ConnectionId,
        direction: Option<MoveDirection>,
        position: Option<f64>,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let room_id = connections.room_of(conn).ok_or(EngineError::NotInRoom)?;
        let room = rooms
            .get_mut(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        let side = room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
        if room.state.finished {
            return Ok(());
        }
        match (position, direction) {
            (Some(y), _) => room.state.set_paddle(&self.config, side, y),
            (None, Some(MoveDirection::Up)) => {
                room.state
                    .nudge_paddle(&self.config, side, -self.config.paddle_step)
            }
            (None, Some(MoveDirection::Down)) => {
                room.state
                    .nudge_paddle(&self.config, side, self.config.paddle_step)
            }
            (None, Some(MoveDirection::Stop)) | (None, None) => {}
        }
        Ok(())
    }

    /// PADDLE_POSITION: always applied to the sender's own side.
    pub fn set_paddle_position(
        &self,
        conn: ConnectionId,
        room_id: &str,
        player_number: u8,
        paddle_y: f64,
    ) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        let side = room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
        if side.player_number() != player_number {
            tracing::warn!(
                room_id,
                connection_id = conn,
                claimed = player_number,
                actual = side.player_number(),
                "Paddle update for the wrong side"
            );
        }
        if !room.state.finished {
            room.state.set_paddle(&self.config, side, paddle_y);
        }
        Ok(())
    }

    /// Forward a client's ball view to the opponent. Display only.
    pub fn relay_ball_state(
        &self,
        conn: ConnectionId,
        room_id: &str,
        ball_state: Value,
    ) -> Result<(), EngineError> {
        let inner = self.lock();
        let room = inner
            .rooms
            .get(room_id)
            .ok_or_else(|| EngineError::UnknownRoom(room_id.to_string()))?;
        let side = room.side_of_connection(conn).ok_or(EngineError::NotInRoom)?;
        if let Some(opponent) = &room.slots[side.opponent().index()] {
            inner.connections.send(
                opponent.connection_id,
                &ServerMessage::BallState {
                    room_id: room_id.to_string(),
                    ball_state,
                },
            );
        }
        Ok(())
    }

    /// Explicit disconnect intent. Always forfeits a live match. With a
    /// `match_id` and no live room, forfeits the persisted match if it is
    /// still in progress.
    pub async fn player_disconnect(
        self: &Arc<Self>,
        conn: ConnectionId,
        room_id: Option<String>,
        match_id: Option<i64>,
    ) -> Result<(), EngineError> {
        let identity = self.identity(conn).ok_or(EngineError::AuthRequired)?;
        let match_room = match_id.map(|m| m.to_string());
        let named: Vec<String> = room_id.into_iter().chain(match_room).collect();

        let (seated_in, named_exists) = {
            let inner = self.lock();
            let seated_in = named
                .iter()
                .cloned()
                .chain(inner.connections.room_of(conn).map(str::to_string))
                .find(|r| {
                    inner
                        .rooms
                        .get(r)
                        .is_some_and(|room| room.side_of_connection(conn).is_some())
                });
            let named_exists = named.iter().any(|r| inner.rooms.get(r).is_some());
            (seated_in, named_exists)
        };

        if let Some(room_id) = seated_in {
            if let Some(outcome) = self.leave_room(conn, &room_id, true) {
                self.finalize(outcome).await;
            }
            return Ok(());
        }
        // A live room for the match owns its result; only roomless rows fall back to storage.
        if named_exists {
            return Err(EngineError::NotInRoom);
        }

        let Some(match_id) = match_id else {
            return Ok(());
        };
        let m = self
            .db
            .get_tournament_match(match_id)
            .await?
            .ok_or(EngineError::UnknownMatch(match_id))?;
        if m.status() != Some(MatchStatus::InProgress) {
            tracing::debug!(match_id, status = %m.status, "No live match to forfeit");
            return Ok(());
        }
        let leaver = m
            .slot_of(identity.user_id)
            .ok_or(EngineError::NotParticipant)?;
        let (Some(p1), Some(p2)) = (m.player1_id, m.player2_id) else {
            return Ok(());
        };
        let win = self.config.win_score;
        let (winner_id, loser_id, scores) = match leaver {
            MatchSlot::Player1 => (p2, p1, [0, win]),
            MatchSlot::Player2 => (p1, p2, [win, 0]),
        };
        tracing::info!(match_id, winner_id, loser_id, "Forfeiting orphaned match");
        self.finalize(MatchCompleted {
            room_id: match_id.to_string(),
            kind: RoomKind::Tournament { match_id },
            tournament_id: Some(m.tournament_id),
            player_ids: [p1, p2],
            winner_id,
            loser_id,
            scores,
            reason: EndReason::Forfeit,
        })
        .await;
        Ok(())
    }

    /// Tear down live rooms for deleted tournament matches.
    pub fn close_tournament_rooms(&self, match_ids: &[i64]) -> usize {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let mut closed = 0;
        for match_id in match_ids {
            let room_id = match_id.to_string();
            let Some(room) = rooms.delete(&room_id) else {
                continue;
            };
            let ids = room.connection_ids();
            for id in &ids {
                connections.clear_room_if(*id, &room_id);
            }
            connections.send_many(
                ids,
                &ServerMessage::RoomClosed {
                    room_id: room_id.clone(),
                    reason: "tournament_deleted".to_string(),
                },
            );
            closed += 1;
        }
        if closed > 0 {
            tracing::info!(closed, "Closed rooms of deleted tournament");
        }
        closed
    }

    // ── Tick loop ────────────────────────────────────────────────────

    fn spawn_tick(self: &Arc<Self>, room_id: &str) -> AbortHandle {
        let server: Weak<Self> = Arc::downgrade(self);
        let room_id = room_id.to_string();
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(server) = server.upgrade() else {
                    break;
                };
                match server.tick_room(&room_id) {
                    TickOutcome::Continue => {}
                    TickOutcome::Stop => break,
                    TickOutcome::Finished(outcome) => {
                        if let Some(outcome) = outcome {
                            server.spawn_finalize(outcome);
                        }
                        break;
                    }
                }
            }
        })
        .abort_handle()
    }

    fn tick_room(self: &Arc<Self>, room_id: &str) -> TickOutcome {
        let tick_start = Instant::now();
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        let Some(room) = rooms.get_mut(room_id) else {
            return TickOutcome::Stop;
        };
        if room.state.finished {
            return TickOutcome::Stop;
        }

        let event = room.state.step(&self.config, &mut rand::thread_rng());
        let outcome = match event {
            StepEvent::Skipped => TickOutcome::Continue,
            StepEvent::Moved => {
                Self::broadcast_state(room, connections);
                TickOutcome::Continue
            }
            StepEvent::Scored { scorer } => {
                Self::broadcast_score(room, connections, scorer);
                Self::broadcast_state(room, connections);
                TickOutcome::Continue
            }
            StepEvent::Won { winner } => {
                Self::broadcast_score(room, connections, winner);
                TickOutcome::Finished(self.conclude(room, connections, winner, EndReason::Win))
            }
        };
        metrics::GAME_TICK_DURATION_MS.observe(tick_start.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    fn broadcast_state(room: &Room, connections: &ConnectionRegistry) {
        connections.send_many(
            room.connection_ids(),
            &ServerMessage::GameStateUpdate {
                room_id: room.id.clone(),
                ball: room.state.ball,
                paddles: room.state.paddles,
                scores: room.state.scores,
            },
        );
    }

    fn broadcast_score(room: &Room, connections: &ConnectionRegistry, scorer: Side) {
        connections.send_many(
            room.connection_ids(),
            &ServerMessage::ScoreUpdate {
                room_id: room.id.clone(),
                scores: room.state.scores,
                scorer: scorer.player_number(),
            },
        );
    }

    // ── Termination ──────────────────────────────────────────────────

    /// Finish a room under the lock: stop ticking, notify occupants, schedule
    /// cleanup. Returns what must be persisted.
    fn conclude(
        self: &Arc<Self>,
        room: &mut Room,
        connections: &ConnectionRegistry,
        winner: Side,
        reason: EndReason,
    ) -> Option<MatchCompleted> {
        room.state.finished = true;
        room.state.paused = false;
        room.cancel_tick();
        self.schedule_cleanup(&room.id);

        let final_scores = room.state.scores;
        let (Some(winner_id), Some(loser_id)) =
            (room.user_id(winner), room.user_id(winner.opponent()))
        else {
            tracing::warn!(room_id = %room.id, "Match ended without two known players");
            return None;
        };

        match reason {
            EndReason::Win => connections.send_many(
                room.connection_ids(),
                &ServerMessage::GameEnded {
                    room_id: room.id.clone(),
                    winner: winner.player_number(),
                    winner_user_id: winner_id,
                    final_scores,
                },
            ),
            EndReason::Forfeit => connections.send_many(
                room.connection_ids(),
                &ServerMessage::OpponentDisconnected {
                    room_id: room.id.clone(),
                    winner_user_id: winner_id,
                    final_scores,
                    message: "Your opponent disconnected. You win!".to_string(),
                },
            ),
        }

        let kind = room.kind.label();
        metrics::GAMES_COMPLETED_TOTAL
            .with_label_values(&[kind, reason.as_str()])
            .inc();
        if let Some(started_at) = room.state.started_at {
            metrics::GAME_DURATION_SECONDS
                .with_label_values(&[kind])
                .observe(started_at.elapsed().as_secs_f64());
        }
        tracing::info!(
            room_id = %room.id,
            winner_id,
            loser_id,
            reason = reason.as_str(),
            scores = ?final_scores,
            "Match finished"
        );

        let player_ids = match winner {
            Side::Left => [winner_id, loser_id],
            Side::Right => [loser_id, winner_id],
        };
        Some(MatchCompleted {
            room_id: room.id.clone(),
            kind: room.kind,
            tournament_id: room.tournament.map(|t| t.tournament_id),
            player_ids,
            winner_id,
            loser_id,
            scores: final_scores,
            reason,
        })
    }

    fn schedule_cleanup(self: &Arc<Self>, room_id: &str) {
        let server = Arc::downgrade(self);
        let room_id = room_id.to_string();
        let delay = self.config.room_cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(server) = server.upgrade() {
                server.cleanup_room(&room_id);
            }
        });
    }

    fn cleanup_room(&self, room_id: &str) {
        let mut inner = self.lock();
        let Inner { connections, rooms } = &mut *inner;
        if !rooms.get(room_id).is_some_and(|r| r.state.finished) {
            return;
        }
        if let Some(room) = rooms.delete(room_id) {
            for id in room.connection_ids() {
                connections.clear_room_if(id, room_id);
            }
        }
    }

    fn spawn_finalize(self: &Arc<Self>, outcome: MatchCompleted) {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.finalize(outcome).await });
    }

    /// Persist a finished match and advance its bracket. Failures are logged
    /// and counted; the in-memory result stands either way.
    async fn finalize(&self, outcome: MatchCompleted) {
        let recorded = match self.persist(&outcome).await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::error!(room_id = %outcome.room_id, "Failed to persist match result: {e}");
                metrics::PERSISTENCE_FAILURES_TOTAL.inc();
                true
            }
        };
        if recorded {
            // No subscribers is fine.
            let _ = self.completions.send(outcome);
        }
    }

    /// Returns false when another completion path already recorded this match.
    async fn persist(&self, outcome: &MatchCompleted) -> Result<bool, sqlx::Error> {
        let [p1_score, p2_score] = outcome.scores.map(i64::from);
        let match_id = match outcome.kind {
            RoomKind::Casual => {
                self.db
                    .insert_game(&NewGame {
                        player1_id: outcome.player_ids[0],
                        player2_id: outcome.player_ids[1],
                        winner_id: outcome.winner_id,
                        player1_score: p1_score,
                        player2_score: p2_score,
                        game_type: RoomKind::Casual.game_type(),
                        tournament_match_id: None,
                    })
                    .await?;
                return Ok(true);
            }
            RoomKind::Tournament { match_id } => match_id,
        };

        let Some(m) = self.db.get_tournament_match(match_id).await? else {
            tracing::warn!(match_id, "Finished room has no tournament match row");
            return Ok(false);
        };
        if !self
            .db
            .complete_match(match_id, outcome.winner_id, p1_score, p2_score)
            .await?
        {
            tracing::debug!(match_id, "Match already completed by another path");
            return Ok(false);
        }
        self.db
            .insert_game(&NewGame {
                player1_id: m.player1_id.unwrap_or(outcome.player_ids[0]),
                player2_id: m.player2_id.unwrap_or(outcome.player_ids[1]),
                winner_id: outcome.winner_id,
                player1_score: p1_score,
                player2_score: p2_score,
                game_type: outcome.kind.game_type(),
                tournament_match_id: Some(match_id),
            })
            .await?;

        let advancement =
            tournament::advance(&self.db, m.tournament_id, match_id, outcome.winner_id).await?;
        tracing::info!(match_id, ?advancement, "Bracket advanced");

        self.broadcast(&ServerMessage::TournamentUpdated {
            tournament_id: m.tournament_id,
            action: "match_completed".to_string(),
        });
        if advancement == Advancement::TournamentCompleted {
            self.broadcast(&ServerMessage::TournamentUpdated {
                tournament_id: m.tournament_id,
                action: "tournament_completed".to_string(),
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_config() -> GameConfig {
        GameConfig {
            auto_start_delay: Duration::from_secs(60),
            room_cleanup_delay: Duration::from_millis(50),
            ..GameConfig::default()
        }
    }

    async fn test_server() -> Arc<GameServer> {
        let db = Database::new("sqlite::memory:").await.unwrap();
        Arc::new(GameServer::new(Arc::new(db), fast_config()))
    }

    fn player(
        server: &GameServer,
        user_id: i64,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = server.connect(tx);
        server
            .authenticate(
                conn,
                Identity {
                    user_id,
                    username: format!("user{user_id}"),
                },
            )
            .unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_join_requires_authentication() {
        let server = test_server().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = server.connect(tx);
        let err = server.join_room(conn, "casual-a").await.unwrap_err();
        assert!(matches!(err, EngineError::AuthRequired));
        assert_eq!(server.room_count(), 0);
    }

    #[tokio::test]
    async fn test_seated_connection_cannot_switch_user() {
        let server = test_server().await;
        let (a, mut ra) = player(&server, 1);
        server.join_room(a, "casual-id").await.unwrap();
        drain(&mut ra);

        let other = Identity {
            user_id: 2,
            username: "user2".to_string(),
        };
        let err = server.authenticate(a, other.clone()).unwrap_err();
        assert!(matches!(err, EngineError::IdentityLocked));
        assert_eq!(server.identity(a).unwrap().user_id, 1);
        assert!(!server.is_online(2));
        assert!(drain(&mut ra).is_empty());

        // Refreshing the same user's token is fine.
        let same = Identity {
            user_id: 1,
            username: "user1".to_string(),
        };
        server.authenticate(a, same).unwrap();

        // Outside a room the switch goes through.
        server.player_disconnect(a, None, None).await.unwrap();
        assert!(server.room_of(a).is_none());
        server.authenticate(a, other).unwrap();
        assert_eq!(server.identity(a).unwrap().user_id, 2);
    }

    #[tokio::test]
    async fn test_third_player_is_rejected() {
        let server = test_server().await;
        let (a, _ra) = player(&server, 1);
        let (b, _rb) = player(&server, 2);
        let (c, _rc) = player(&server, 3);
        server.join_room(a, "casual-a").await.unwrap();
        server.join_room(b, "casual-a").await.unwrap();
        let err = server.join_room(c, "casual-a").await.unwrap_err();
        assert!(matches!(err, EngineError::RoomFull));

        server.start_game("casual-a", Some(a)).await.unwrap();
        let err = server.join_room(c, "casual-a").await.unwrap_err();
        assert!(matches!(err, EngineError::InProgress));
    }

    #[tokio::test]
    async fn test_double_start_spawns_one_tick() {
        let server = test_server().await;
        let (a, mut ra) = player(&server, 1);
        let (b, _rb) = player(&server, 2);
        server.join_room(a, "casual-b").await.unwrap();
        server.join_room(b, "casual-b").await.unwrap();
        drain(&mut ra);

        let (first, second) = tokio::join!(
            server.start_game("casual-b", Some(a)),
            server.start_game("casual-b", None)
        );
        first.unwrap();
        second.unwrap();

        let starts = drain(&mut ra)
            .iter()
            .filter(|m| m.contains("GAME_STARTED"))
            .count();
        assert_eq!(starts, 1);
        assert!(server.room_status("casual-b").unwrap().ticking);
    }

    #[tokio::test]
    async fn test_start_needs_two_players() {
        let server = test_server().await;
        let (a, _ra) = player(&server, 1);
        server.join_room(a, "casual-c").await.unwrap();
        let err = server.start_game("casual-c", Some(a)).await.unwrap_err();
        assert!(matches!(err, EngineError::WaitingForOpponent));
    }

    #[tokio::test]
    async fn test_ready_from_both_starts() {
        let server = test_server().await;
        let (a, mut ra) = player(&server, 1);
        let (b, _rb) = player(&server, 2);
        server.join_room(a, "casual-d").await.unwrap();
        server.join_room(b, "casual-d").await.unwrap();

        server.mark_ready(a, "casual-d").await.unwrap();
        assert!(!server.room_status("casual-d").unwrap().started);
        server.mark_ready(b, "casual-d").await.unwrap();
        assert!(server.room_status("casual-d").unwrap().started);

        let frames = drain(&mut ra);
        assert!(frames.iter().any(|m| m.contains("PLAYER_READY")));
        assert!(frames.iter().any(|m| m.contains("GAME_STARTED")));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let server = test_server().await;
        let (a, mut ra) = player(&server, 1);
        let (b, _rb) = player(&server, 2);
        server.join_room(a, "casual-e").await.unwrap();
        server.join_room(b, "casual-e").await.unwrap();

        assert!(matches!(
            server.pause(a, "casual-e"),
            Err(EngineError::NotRunning)
        ));
        server.start_game("casual-e", Some(a)).await.unwrap();
        server.pause(b, "casual-e").unwrap();
        let status = server.room_status("casual-e").unwrap();
        assert!(status.paused && status.ticking);

        server.resume(a, "casual-e").unwrap();
        assert!(!server.room_status("casual-e").unwrap().paused);
        let frames = drain(&mut ra);
        assert!(frames.iter().any(|m| m.contains("GAME_PAUSED")));
        assert!(frames.iter().any(|m| m.contains("pauseDurationMs")));
    }

    #[tokio::test]
    async fn test_leaving_before_start_frees_the_seat() {
        let server = test_server().await;
        let (a, _ra) = player(&server, 1);
        let (b, _rb) = player(&server, 2);
        let (c, _rc) = player(&server, 3);
        server.join_room(a, "casual-f").await.unwrap();
        server.join_room(b, "casual-f").await.unwrap();

        server.disconnect(b);
        assert_eq!(server.room_status("casual-f").unwrap().occupants, 1);
        server.join_room(c, "casual-f").await.unwrap();
        assert_eq!(server.room_status("casual-f").unwrap().occupants, 2);

        server.disconnect(a);
        server.disconnect(c);
        assert!(server.room_status("casual-f").is_none());
    }

    #[tokio::test]
    async fn test_second_tab_does_not_forfeit() {
        let server = test_server().await;
        let (a, _ra) = player(&server, 1);
        let (a2, _ra2) = player(&server, 1);
        let (b, mut rb) = player(&server, 2);
        server.join_room(a, "casual-g").await.unwrap();
        server.join_room(b, "casual-g").await.unwrap();
        server.start_game("casual-g", None).await.unwrap();

        server.disconnect(a);
        let status = server.room_status("casual-g").unwrap();
        assert!(!status.finished);
        assert!(!drain(&mut rb)
            .iter()
            .any(|m| m.contains("OPPONENT_DISCONNECTED")));

        // The other tab takes the seat back.
        server.join_room(a2, "casual-g").await.unwrap();
        assert_eq!(server.room_status("casual-g").unwrap().occupants, 2);
    }

    #[tokio::test]
    async fn test_close_tournament_rooms() {
        let server = test_server().await;
        let db = server.db().clone();
        let t = db.create_tournament("T", 2, 1).await.unwrap();
        let m = db
            .create_tournament_match(t.id, 1, 1, Some(1), Some(2))
            .await
            .unwrap();
        let (a, mut ra) = player(&server, 1);
        server.join_room(a, &m.id.to_string()).await.unwrap();

        assert_eq!(server.close_tournament_rooms(&[m.id, 999]), 1);
        assert!(server.room_of(a).is_none());
        assert!(drain(&mut ra).iter().any(|f| f.contains("ROOM_CLOSED")));
    }

    #[tokio::test]
    async fn test_tournament_room_rejects_outsiders() {
        let server = test_server().await;
        let db = server.db().clone();
        let t = db.create_tournament("T", 2, 1).await.unwrap();
        let m = db
            .create_tournament_match(t.id, 1, 1, Some(1), Some(2))
            .await
            .unwrap();
        let (c, _rc) = player(&server, 3);
        let err = server.join_room(c, &m.id.to_string()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotParticipant));

        let err = server.join_room(c, "987").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownMatch(987)));
        assert_eq!(server.room_count(), 0);
    }

    #[tokio::test]
    async fn test_tournament_start_requires_acceptance() {
        let server = test_server().await;
        let db = server.db().clone();
        let t = db.create_tournament("T", 2, 1).await.unwrap();
        let m = db
            .create_tournament_match(t.id, 1, 1, Some(1), Some(2))
            .await
            .unwrap();
        let room_id = m.id.to_string();
        let (a, _ra) = player(&server, 1);
        let (b, _rb) = player(&server, 2);
        server.join_room(b, &room_id).await.unwrap();
        server.join_room(a, &room_id).await.unwrap();

        let err = server.start_game(&room_id, Some(a)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotAccepted));

        db.accept_match(m.id, MatchSlot::Player1)
            .await
            .unwrap();
        db.accept_match(m.id, MatchSlot::Player2)
            .await
            .unwrap();
        db.promote_accepted(m.id).await.unwrap();
        server.start_game(&room_id, Some(a)).await.unwrap();

        let row = db.get_tournament_match(m.id).await.unwrap().unwrap();
        assert_eq!(row.status(), Some(MatchStatus::InProgress));
    }
}
