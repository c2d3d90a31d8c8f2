//! Connection registry
//!
//! Three coupled indices over the set of live connections:
//! connection → state, room → member connections, user → connection.
//! A connection is in at most one room; `state.room_id == Some(r)` holds
//! exactly when the connection is in `rooms[r]`. Only `join_room`,
//! `leave_room` and `remove` touch room membership.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::message::{OnlineUser, PresenceStatus, RoomUser};
use crate::types::{ConnId, MessageId, RoomId, UserId};

/// Pre-serialized envelope queued for a connection's writer task, shared
/// across all targets of a broadcast
pub type Outbound = Arc<str>;

/// Server-side ends of a connection's writer
///
/// Frames go through a bounded queue. The close signal is separate, so a
/// peer that stopped draining its queue can still be closed. Dropping the
/// link without firing it closes the socket as well.
#[derive(Debug)]
pub struct ConnectionLink {
    pub frames: mpsc::Sender<Outbound>,
    pub close: oneshot::Sender<String>,
}

/// Writer-side ends matching a [`ConnectionLink`]
#[derive(Debug)]
pub struct LinkReceiver {
    pub frames: mpsc::Receiver<Outbound>,
    pub close: oneshot::Receiver<String>,
}

/// Create the queue and close signal for one connection
pub fn connection_link(buffer: usize) -> (ConnectionLink, LinkReceiver) {
    let (frames_tx, frames_rx) = mpsc::channel(buffer);
    let (close_tx, close_rx) = oneshot::channel();
    (
        ConnectionLink {
            frames: frames_tx,
            close: close_tx,
        },
        LinkReceiver {
            frames: frames_rx,
            close: close_rx,
        },
    )
}

/// Attributes attached to a live connection
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Set by the first `presence` announcement
    pub user_id: Option<UserId>,
    pub username: Option<String>,
    /// Current room, if any
    pub room_id: Option<RoomId>,
    /// Last time a well-formed frame arrived
    pub last_activity: Instant,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            user_id: None,
            username: None,
            room_id: None,
            last_activity: Instant::now(),
        }
    }

    /// Check if this connection has announced an identity
    pub fn is_identified(&self) -> bool {
        self.user_id.is_some()
    }

    /// Returns the username if set, otherwise "Unknown"
    pub fn display_name(&self) -> &str {
        self.username.as_deref().unwrap_or("Unknown")
    }
}

/// Partial state merged by [`ConnectionRegistry::update`]
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub user_id: Option<UserId>,
    pub username: Option<String>,
}

/// Outstanding history load of a connection that just joined a room
#[derive(Debug, Clone, Copy)]
struct HistoryGate {
    room_id: RoomId,
    /// First message delivered live while the load was running
    first_live: Option<MessageId>,
}

#[derive(Debug)]
struct Entry {
    sender: mpsc::Sender<Outbound>,
    /// Taken when the close signal fires
    closer: Option<oneshot::Sender<String>>,
    history: Option<HistoryGate>,
    state: ConnectionState,
}

/// Registry of live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnId, Entry>,
    rooms: HashMap<RoomId, HashSet<ConnId>>,
    users: HashMap<UserId, ConnId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection
    pub fn add(&mut self, conn_id: ConnId, link: ConnectionLink, initial: StateUpdate) {
        self.connections.insert(
            conn_id,
            Entry {
                sender: link.frames,
                closer: Some(link.close),
                history: None,
                state: ConnectionState::new(),
            },
        );
        self.update(conn_id, initial);
    }

    /// Merge identity fields and refresh `last_activity`
    ///
    /// A `user_id` (re)points the user index at this connection; an earlier
    /// connection of the same user stays open but is no longer reachable
    /// by user id.
    pub fn update(&mut self, conn_id: ConnId, update: StateUpdate) -> bool {
        let Some(entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };

        if let Some(user_id) = update.user_id {
            if let Some(previous) = entry.state.user_id.replace(user_id.clone()) {
                if previous != user_id && self.users.get(&previous) == Some(&conn_id) {
                    self.users.remove(&previous);
                }
            }
            self.users.insert(user_id, conn_id);
        }
        if let Some(username) = update.username {
            entry.state.username = Some(username);
        }
        entry.state.last_activity = Instant::now();
        true
    }

    /// Forget the identity of a connection that stays open
    ///
    /// The connection must have left its room first; identity is what
    /// room membership hangs on.
    pub fn clear_identity(&mut self, conn_id: ConnId) -> Option<UserId> {
        let entry = self.connections.get_mut(&conn_id)?;
        debug_assert!(entry.state.room_id.is_none());
        entry.state.username = None;
        let user_id = entry.state.user_id.take()?;
        if self.users.get(&user_id) == Some(&conn_id) {
            self.users.remove(&user_id);
        }
        Some(user_id)
    }

    /// Refresh `last_activity` without changing anything else
    pub fn touch(&mut self, conn_id: ConnId) {
        if let Some(entry) = self.connections.get_mut(&conn_id) {
            entry.state.last_activity = Instant::now();
        }
    }

    /// Ask the writer of a connection to close the socket
    ///
    /// Does not depend on outbound queue capacity. Returns false when the
    /// connection is unknown, already asked, or its writer is gone.
    pub fn close(&mut self, conn_id: ConnId, reason: &str) -> bool {
        self.connections
            .get_mut(&conn_id)
            .and_then(|entry| entry.closer.take())
            .is_some_and(|closer| closer.send(reason.to_string()).is_ok())
    }

    /// Drop a connection from every index, returning its final state
    ///
    /// Idempotent: a second call returns `None`.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<ConnectionState> {
        let entry = self.connections.remove(&conn_id)?;

        if let Some(room_id) = entry.state.room_id {
            self.detach_from_room(conn_id, room_id);
        }
        if let Some(user_id) = &entry.state.user_id {
            if self.users.get(user_id) == Some(&conn_id) {
                self.users.remove(user_id);
            }
        }
        Some(entry.state)
    }

    /// Move a connection into `room_id`
    ///
    /// No-op (returns true) when already there. Returns false for an
    /// unknown or unidentified connection.
    pub fn join_room(&mut self, conn_id: ConnId, room_id: RoomId) -> bool {
        let Some(entry) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !entry.state.is_identified() {
            return false;
        }
        if entry.state.room_id == Some(room_id) {
            return true;
        }

        let previous = entry.state.room_id.replace(room_id);
        entry.state.last_activity = Instant::now();

        if let Some(previous) = previous {
            self.detach_from_room(conn_id, previous);
        }
        self.rooms.entry(room_id).or_default().insert(conn_id);
        true
    }

    /// Take a connection out of its room, returning the room it left
    pub fn leave_room(&mut self, conn_id: ConnId) -> Option<RoomId> {
        let entry = self.connections.get_mut(&conn_id)?;
        let room_id = entry.state.room_id.take()?;
        entry.state.last_activity = Instant::now();

        self.detach_from_room(conn_id, room_id);
        Some(room_id)
    }

    /// Start tracking live messages for a connection whose history of
    /// `room_id` is being loaded
    pub fn begin_history(&mut self, conn_id: ConnId, room_id: RoomId) {
        if let Some(entry) = self.connections.get_mut(&conn_id) {
            entry.history = Some(HistoryGate {
                room_id,
                first_live: None,
            });
        }
    }

    /// Record a message fanned out live to `room_id`
    pub fn note_live(&mut self, room_id: RoomId, message_id: MessageId) {
        let Some(members) = self.rooms.get(&room_id) else {
            return;
        };
        for conn_id in members {
            let Some(entry) = self.connections.get_mut(conn_id) else {
                continue;
            };
            if let Some(gate) = entry.history.as_mut() {
                if gate.room_id == room_id && gate.first_live.is_none() {
                    gate.first_live = Some(message_id);
                }
            }
        }
    }

    /// Stop tracking, returning the first message id the connection
    /// already received live. History rows from that id on are duplicates.
    pub fn end_history(&mut self, conn_id: ConnId) -> Option<MessageId> {
        self.connections.get_mut(&conn_id)?.history.take()?.first_live
    }

    fn detach_from_room(&mut self, conn_id: ConnId, room_id: RoomId) {
        if let Some(members) = self.rooms.get_mut(&room_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
    }

    pub fn state(&self, conn_id: ConnId) -> Option<&ConnectionState> {
        self.connections.get(&conn_id).map(|entry| &entry.state)
    }

    pub fn sender(&self, conn_id: ConnId) -> Option<&mpsc::Sender<Outbound>> {
        self.connections.get(&conn_id).map(|entry| &entry.sender)
    }

    /// Connections currently in a room
    pub fn room_members(&self, room_id: RoomId) -> Vec<ConnId> {
        self.rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Identified members of a room, ordered by user id
    pub fn room_user_list(&self, room_id: RoomId) -> Vec<RoomUser> {
        let mut users: Vec<RoomUser> = self
            .room_members(room_id)
            .into_iter()
            .filter_map(|conn_id| self.state(conn_id))
            .filter_map(|state| {
                Some(RoomUser {
                    user_id: state.user_id.clone()?,
                    username: state.username.clone()?,
                })
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Connection currently reachable for `user_id`
    pub fn user_connection(&self, user_id: &UserId) -> Option<ConnId> {
        self.users.get(user_id).copied()
    }

    /// Every live connection, identified or not
    pub fn all_connections(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.connections.keys().copied()
    }

    /// One entry per reachable user, ordered by user id
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .users
            .iter()
            .filter_map(|(user_id, conn_id)| {
                let state = self.state(*conn_id)?;
                Some(OnlineUser {
                    user_id: user_id.clone(),
                    username: state.username.clone()?,
                    status: PresenceStatus::Online,
                })
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Rooms with at least one member
    pub fn active_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms.keys().copied().collect();
        rooms.sort();
        rooms
    }

    pub fn room_connection_count(&self, room_id: RoomId) -> usize {
        self.rooms.get(&room_id).map_or(0, HashSet::len)
    }

    pub fn total_connections(&self) -> usize {
        self.connections.len()
    }

    /// Connections silent for longer than `timeout` as of `now`
    pub fn stale_connections(&self, now: Instant, timeout: Duration) -> Vec<ConnId> {
        self.connections
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.state.last_activity) > timeout)
            .map(|(conn_id, _)| *conn_id)
            .collect()
    }
}
