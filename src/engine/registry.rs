// Connection registry: live transports, their bound identity and current room.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;

use crate::metrics;

use super::protocol::ServerMessage;

pub type ConnectionId = u64;

/// Outbound half of a connection; the WebSocket task drains it.
pub type Outbound = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    tx: Outbound,
    pub identity: Option<Identity>,
    pub room_id: Option<String>,
}

/// Presence transitions caused by a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    CameOnline(i64),
    WentOffline(i64),
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<i64, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ConnectionId, tx: Outbound) {
        self.connections.insert(
            id,
            Connection {
                id,
                tx,
                identity: None,
                room_id: None,
            },
        );
        metrics::CONNECTED_WEBSOCKETS.inc();
    }

    /// Bind an identity to a connection, replacing any previous one.
    /// Returns the presence changes this caused (at most one offline, one online).
    pub fn authenticate(&mut self, id: ConnectionId, identity: Identity) -> Vec<Presence> {
        let mut changes = Vec::new();
        let Some(conn) = self.connections.get_mut(&id) else {
            return changes;
        };
        let user_id = identity.user_id;
        if let Some(previous) = conn.identity.replace(identity) {
            if previous.user_id == user_id {
                return changes;
            }
            if let Some(change) = Self::detach_user(&mut self.by_user, previous.user_id, id) {
                changes.push(change);
            }
        }
        let set = self.by_user.entry(user_id).or_default();
        let first = set.is_empty();
        set.insert(id);
        if first {
            changes.push(Presence::CameOnline(user_id));
        }
        self.update_online_gauge();
        changes
    }

    pub fn set_room(&mut self, id: ConnectionId, room_id: Option<String>) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.room_id = room_id;
        }
    }

    /// Clear the room pointer only if it still points at `room_id`.
    pub fn clear_room_if(&mut self, id: ConnectionId, room_id: &str) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.room_id.as_deref() == Some(room_id) {
                conn.room_id = None;
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn identity(&self, id: ConnectionId) -> Option<&Identity> {
        self.connections.get(&id)?.identity.as_ref()
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<&str> {
        self.connections.get(&id)?.room_id.as_deref()
    }

    /// Remove a connection. The caller is responsible for vacating its room.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<(Connection, Option<Presence>)> {
        let conn = self.connections.remove(&id)?;
        metrics::CONNECTED_WEBSOCKETS.dec();
        let presence = conn
            .identity
            .as_ref()
            .and_then(|identity| Self::detach_user(&mut self.by_user, identity.user_id, id));
        self.update_online_gauge();
        Some((conn, presence))
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.by_user.get(&user_id).is_some_and(|set| !set.is_empty())
    }

    pub fn connections_for_user(&self, user_id: i64) -> usize {
        self.by_user.get(&user_id).map_or(0, |set| set.len())
    }

    pub fn online_user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Send to one connection. A closed transport is not an error for the caller.
    pub fn send(&self, id: ConnectionId, msg: &ServerMessage) -> bool {
        let Some(json) = msg.to_json() else {
            return false;
        };
        self.send_json(id, json)
    }

    fn send_json(&self, id: ConnectionId, json: String) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        if conn.tx.send(json).is_err() {
            tracing::debug!(connection_id = id, "Dropping message for closed connection");
            return false;
        }
        metrics::WEBSOCKET_MESSAGES_SENT_TOTAL.inc();
        true
    }

    /// Send the same frame to several connections, serializing once.
    pub fn send_many<I>(&self, ids: I, msg: &ServerMessage)
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        let Some(json) = msg.to_json() else {
            return;
        };
        for id in ids {
            self.send_json(id, json.clone());
        }
    }

    /// Send to every authenticated connection, optionally skipping one.
    pub fn broadcast_authenticated(&self, msg: &ServerMessage, except: Option<ConnectionId>) {
        let ids: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.identity.is_some() && Some(c.id) != except)
            .map(|c| c.id)
            .collect();
        self.send_many(ids, msg);
    }

    fn detach_user(
        by_user: &mut HashMap<i64, HashSet<ConnectionId>>,
        user_id: i64,
        id: ConnectionId,
    ) -> Option<Presence> {
        let set = by_user.get_mut(&user_id)?;
        set.remove(&id);
        if set.is_empty() {
            by_user.remove(&user_id);
            return Some(Presence::WentOffline(user_id));
        }
        None
    }

    fn update_online_gauge(&self) {
        metrics::ONLINE_USERS.set(self.by_user.len() as i64);
    }
}
