// Room store: in-memory match rooms keyed by room id.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tokio::task::AbortHandle;

use crate::metrics;

use super::config::GameConfig;
use super::physics::{MatchState, Side};
use super::protocol::PlayerInfo;
use super::registry::{ConnectionId, Identity};

/// Numeric room ids name a persisted tournament match; anything else is casual.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomKind {
    Casual,
    Tournament { match_id: i64 },
}

impl RoomKind {
    pub fn from_room_id(room_id: &str) -> Self {
        match room_id.parse::<i64>() {
            Ok(match_id) if match_id > 0 => RoomKind::Tournament { match_id },
            _ => RoomKind::Casual,
        }
    }

    pub fn game_type(self) -> &'static str {
        match self {
            RoomKind::Casual => "remote",
            RoomKind::Tournament { .. } => "tournament",
        }
    }

    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            RoomKind::Casual => "casual",
            RoomKind::Tournament { .. } => "tournament",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Occupant {
    pub connection_id: ConnectionId,
    pub ready: bool,
}

/// Persisted context for a tournament room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TournamentLink {
    pub tournament_id: i64,
    pub players: [Option<i64>; 2],
}

#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub kind: RoomKind,
    /// Live occupant per side.
    pub slots: [Option<Occupant>; 2],
    /// Who holds each side, kept after a disconnect so results can be credited.
    pub roster: [Option<Identity>; 2],
    pub state: MatchState,
    pub tournament: Option<TournamentLink>,
    pub auto_start_pending: bool,
    tick: Option<AbortHandle>,
}

impl Room {
    pub fn new(id: &str, cfg: &GameConfig) -> Self {
        Self {
            id: id.to_string(),
            kind: RoomKind::from_room_id(id),
            slots: [None, None],
            roster: [None, None],
            state: MatchState::new(cfg),
            tournament: None,
            auto_start_pending: false,
            tick: None,
        }
    }

    pub fn occupant_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.slots
            .iter()
            .flatten()
            .map(|o| o.connection_id)
            .collect()
    }

    pub fn side_of_connection(&self, id: ConnectionId) -> Option<Side> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|o| o.connection_id == id))
            .and_then(Side::from_index)
    }

    pub fn side_of_user(&self, user_id: i64) -> Option<Side> {
        self.roster
            .iter()
            .position(|r| r.as_ref().is_some_and(|i| i.user_id == user_id))
            .and_then(Side::from_index)
    }

    /// The side a user is entitled to, if any.
    pub fn seat_for(&self, user_id: i64) -> Option<Side> {
        if let Some(side) = self.side_of_user(user_id) {
            return Some(side);
        }
        match self.tournament {
            Some(link) => link
                .players
                .iter()
                .position(|p| *p == Some(user_id))
                .and_then(Side::from_index),
            None => self
                .roster
                .iter()
                .position(|r| r.is_none())
                .and_then(Side::from_index),
        }
    }

    pub fn user_id(&self, side: Side) -> Option<i64> {
        self.roster[side.index()].as_ref().map(|i| i.user_id)
    }

    pub fn players(&self) -> Vec<PlayerInfo> {
        [Side::Left, Side::Right]
            .into_iter()
            .filter(|side| self.slots[side.index()].is_some())
            .filter_map(|side| {
                self.roster[side.index()].as_ref().map(|i| PlayerInfo {
                    user_id: i.user_id,
                    username: i.username.clone(),
                    player_number: side.player_number(),
                })
            })
            .collect()
    }

    pub fn all_ready(&self) -> bool {
        self.occupant_count() == 2 && self.slots.iter().flatten().all(|o| o.ready)
    }

    pub fn has_tick(&self) -> bool {
        self.tick.is_some()
    }

    pub fn set_tick(&mut self, handle: AbortHandle) {
        self.cancel_tick();
        self.tick = Some(handle);
    }

    /// Abort the tick task if one is running. Safe to call repeatedly.
    pub fn cancel_tick(&mut self) -> bool {
        match self.tick.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.cancel_tick();
    }
}

#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<String, Room>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, room_id: &str, cfg: &GameConfig) -> &mut Room {
        let count = self.rooms.len();
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                tracing::debug!(room_id, "Creating room");
                metrics::ACTIVE_ROOMS.set(count as i64 + 1);
                entry.insert(Room::new(room_id, cfg))
            }
        }
    }

    pub fn get(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn get_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    /// Remove a room, cancelling its tick task.
    pub fn delete(&mut self, room_id: &str) -> Option<Room> {
        let mut room = self.rooms.remove(room_id)?;
        room.cancel_tick();
        metrics::ACTIVE_ROOMS.set(self.rooms.len() as i64);
        tracing::debug!(room_id, "Deleted room");
        Some(room)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(user_id: i64) -> Identity {
        Identity {
            user_id,
            username: format!("u{user_id}"),
        }
    }

    #[test]
    fn test_room_kind_from_id() {
        assert_eq!(
            RoomKind::from_room_id("42"),
            RoomKind::Tournament { match_id: 42 }
        );
        assert_eq!(RoomKind::from_room_id("casual-1f3a"), RoomKind::Casual);
        assert_eq!(RoomKind::from_room_id("-3"), RoomKind::Casual);
        assert_eq!(RoomKind::Casual.game_type(), "remote");
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let cfg = GameConfig::default();
        let mut store = RoomStore::new();
        store.get_or_create("a", &cfg).auto_start_pending = true;
        assert!(store.get_or_create("a", &cfg).auto_start_pending);
        assert_eq!(store.len(), 1);
        assert!(store.delete("a").is_some());
        assert!(store.delete("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_casual_seating_in_join_order() {
        let cfg = GameConfig::default();
        let mut room = Room::new("casual-x", &cfg);
        assert_eq!(room.seat_for(7), Some(Side::Left));
        room.roster[0] = Some(ident(7));
        room.slots[0] = Some(Occupant {
            connection_id: 1,
            ready: false,
        });
        assert_eq!(room.seat_for(7), Some(Side::Left));
        assert_eq!(room.seat_for(9), Some(Side::Right));
        room.roster[1] = Some(ident(9));
        assert_eq!(room.seat_for(11), None);
    }

    #[test]
    fn test_tournament_seating_follows_row() {
        let cfg = GameConfig::default();
        let mut room = Room::new("5", &cfg);
        room.tournament = Some(TournamentLink {
            tournament_id: 1,
            players: [Some(9), Some(7)],
        });
        assert_eq!(room.seat_for(7), Some(Side::Right));
        assert_eq!(room.seat_for(9), Some(Side::Left));
        assert_eq!(room.seat_for(3), None);
    }

    #[tokio::test]
    async fn test_cancel_tick_is_idempotent() {
        let cfg = GameConfig::default();
        let mut room = Room::new("r", &cfg);
        let task = tokio::spawn(std::future::pending::<()>());
        room.set_tick(task.abort_handle());
        assert!(room.has_tick());
        assert!(room.cancel_tick());
        assert!(!room.cancel_tick());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
