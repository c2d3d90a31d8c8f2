//! Presence and room membership
//!
//! Per-connection lifecycle: unidentified → identified (`presence` online)
//! → in a room (`join_room`) and back, plus the teardown that runs on
//! transport close, heartbeat eviction or an explicit `presence` offline.

use tracing::{debug, info, warn};

use crate::broadcast;
use crate::error::{AppError, StoreError};
use crate::message::{ChatBroadcast, PresencePayload, PresenceStatus, ServerMessage};
use crate::registry::StateUpdate;
use crate::server::{ChatServer, HandlerResult, StoreJob};
use crate::types::{ConnId, RoomId, UserId};

/// `call_ended` reason when a participant goes away
pub const DISCONNECT_REASON: &str = "User disconnected";

impl ChatServer {
    pub(crate) fn handle_presence(
        &mut self,
        conn_id: ConnId,
        payload: PresencePayload,
    ) -> HandlerResult {
        match payload.status {
            PresenceStatus::Online => {
                let username = payload.username.filter(|name| !name.trim().is_empty());
                match username {
                    Some(username) => {
                        self.identify(conn_id, payload.user_id, username);
                        Ok(None)
                    }
                    None => Ok(Some(StoreJob::LookupName {
                        user_id: payload.user_id,
                    })),
                }
            }
            PresenceStatus::Offline => {
                self.go_offline(conn_id, &payload.user_id)?;
                Ok(None)
            }
        }
    }

    /// Bind an identity to a connection and announce it
    ///
    /// Re-announcing refreshes the identity and re-sends the snapshots;
    /// room membership is left as is. Switching to another user id retires
    /// the old one first when this connection was its reachable one, and
    /// tells the room about the swap.
    pub(crate) fn identify(&mut self, conn_id: ConnId, user_id: UserId, username: String) {
        let Some(state) = self.registry.state(conn_id) else {
            debug!("Connection {} closed before identification", conn_id);
            return;
        };
        let room_id = state.room_id;
        let replaced = state
            .user_id
            .clone()
            .filter(|previous| previous != &user_id)
            .map(|previous| (previous, state.display_name().to_string()));

        if let Some((previous, previous_name)) = &replaced {
            info!("Connection {} switches from {} to {}", conn_id, previous, user_id);
            if self.registry.user_connection(previous) == Some(conn_id) {
                self.retire_user(previous, previous_name, room_id, None);
            }
        }

        let update = StateUpdate {
            user_id: Some(user_id.clone()),
            username: Some(username.clone()),
        };
        self.registry.update(conn_id, update);
        info!("Connection {} identified as {} ({})", conn_id, user_id, username);

        if let (Some((previous, previous_name)), Some(room_id)) = (&replaced, room_id) {
            self.announce_departure(previous, previous_name, room_id);
            broadcast::to_room_except(
                &self.registry,
                room_id,
                &ServerMessage::UserJoined {
                    user_id: user_id.clone(),
                    username: username.clone(),
                    room_id,
                },
                conn_id,
            );
        }

        broadcast::to_all(
            &self.registry,
            &ServerMessage::Presence {
                user_id,
                username,
                status: PresenceStatus::Online,
                room_id,
            },
        );
        broadcast::to_conn(
            &self.registry,
            conn_id,
            &ServerMessage::OnlineUsers {
                users: self.registry.online_users(),
            },
        );
        if let Some(room_id) = room_id {
            self.send_room_users(conn_id, room_id);
        }
    }

    fn send_room_users(&self, conn_id: ConnId, room_id: RoomId) {
        broadcast::to_conn(
            &self.registry,
            conn_id,
            &ServerMessage::RoomUsers {
                room_id,
                users: self.registry.room_user_list(room_id),
            },
        );
    }

    pub(crate) fn handle_join_room(&mut self, conn_id: ConnId, room_id: RoomId) -> HandlerResult {
        let (user_id, username) = self.identity(conn_id)?;
        let previous = self.registry.state(conn_id).and_then(|state| state.room_id);

        if previous == Some(room_id) {
            debug!("{} already in room {}", user_id, room_id);
            self.confirm_join(conn_id, room_id);
            return Ok(None);
        }
        if !self.registry.join_room(conn_id, room_id) {
            return Err(AppError::IdentityRequired);
        }
        info!("{} joined room {}", user_id, room_id);

        if let Some(previous) = previous {
            self.stop_typing_in(&user_id, &username, previous);
            self.announce_departure(&user_id, &username, previous);
        }

        broadcast::to_room_except(
            &self.registry,
            room_id,
            &ServerMessage::UserJoined {
                user_id,
                username,
                room_id,
            },
            conn_id,
        );
        self.confirm_join(conn_id, room_id);
        self.registry.begin_history(conn_id, room_id);

        Ok(Some(StoreJob::History { room_id }))
    }

    fn confirm_join(&self, conn_id: ConnId, room_id: RoomId) {
        self.send_room_users(conn_id, room_id);
        broadcast::to_conn(
            &self.registry,
            conn_id,
            &ServerMessage::RoomJoined {
                room_id,
                users: self.registry.room_user_list(room_id),
            },
        );
    }

    /// Replay stored history to a connection that just joined, oldest first
    ///
    /// Messages already delivered live while the load was running are
    /// skipped.
    pub(crate) fn replay_history(
        &mut self,
        conn_id: ConnId,
        room_id: RoomId,
        result: Result<Vec<ChatBroadcast>, StoreError>,
    ) {
        let first_live = self.registry.end_history(conn_id);
        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Could not load history of room {}: {}", room_id, e);
                return;
            }
        };

        let still_there = self
            .registry
            .state(conn_id)
            .is_some_and(|state| state.room_id == Some(room_id));
        if !still_there {
            return;
        }

        let replay: Vec<ChatBroadcast> = messages
            .into_iter()
            .filter(|row| match first_live {
                Some(cutoff) => row.message.id < cutoff,
                None => true,
            })
            .collect();
        debug!("Replaying {} messages of room {} to {}", replay.len(), room_id, conn_id);
        for message in replay {
            broadcast::to_conn(&self.registry, conn_id, &ServerMessage::Chat(message));
        }
    }

    pub(crate) fn handle_leave_room(&mut self, conn_id: ConnId) -> HandlerResult {
        let Some(room_id) = self.registry.leave_room(conn_id) else {
            return Err(AppError::NotInRoom);
        };

        if let Ok((user_id, username)) = self.identity(conn_id) {
            info!("{} left room {}", user_id, room_id);
            self.stop_typing_in(&user_id, &username, room_id);
            self.announce_departure(&user_id, &username, room_id);
        }
        broadcast::to_conn(&self.registry, conn_id, &ServerMessage::RoomLeft { room_id });
        Ok(None)
    }

    /// Tell a room that a user is gone, unless another of their
    /// connections is still in it
    fn announce_departure(&self, user_id: &UserId, username: &str, room_id: RoomId) {
        let still_present = self
            .registry
            .room_user_list(room_id)
            .iter()
            .any(|user| &user.user_id == user_id);
        if still_present {
            return;
        }

        broadcast::to_room(
            &self.registry,
            room_id,
            &ServerMessage::UserLeft {
                user_id: user_id.clone(),
                username: username.to_string(),
                room_id,
            },
        );
    }

    /// Explicit `presence` offline: drop the identity but keep the socket
    fn go_offline(&mut self, conn_id: ConnId, user_id: &UserId) -> Result<(), AppError> {
        let (identity, username) = self.identity(conn_id)?;
        if &identity != user_id {
            return Err(AppError::InvalidSender);
        }

        let room_id = self.registry.leave_room(conn_id);
        self.registry.clear_identity(conn_id);
        info!("{} went offline on {}", user_id, conn_id);

        if self.registry.user_connection(user_id).is_none() {
            self.retire_user(user_id, &username, room_id, Some(conn_id));
        }
        if let Some(room_id) = room_id {
            self.announce_departure(user_id, &username, room_id);
            broadcast::to_conn(&self.registry, conn_id, &ServerMessage::RoomLeft { room_id });
        }
        Ok(())
    }

    /// Transport closed or evicted: remove every trace of the connection
    ///
    /// Safe to call more than once.
    pub(crate) fn handle_disconnect(&mut self, conn_id: ConnId) {
        let Some(state) = self.registry.remove(conn_id) else {
            return;
        };
        info!("Connection {} removed", conn_id);

        if let Some(user_id) = &state.user_id {
            let username = state.display_name().to_string();
            if self.registry.user_connection(user_id).is_none() {
                self.retire_user(user_id, &username, state.room_id, None);
            } else {
                debug!("{} still reachable on another connection", user_id);
            }
            if let Some(room_id) = state.room_id {
                self.announce_departure(user_id, &username, room_id);
            }
        }

        debug!(
            "Total connections: {}, Active rooms: {}",
            self.registry.total_connections(),
            self.registry.active_rooms().len()
        );
    }

    /// Clear typing and calls of a user and broadcast them offline
    fn retire_user(
        &mut self,
        user_id: &UserId,
        username: &str,
        room_id: Option<RoomId>,
        except: Option<ConnId>,
    ) {
        self.clear_typing(user_id, username);
        self.end_calls(user_id, DISCONNECT_REASON);

        let offline = ServerMessage::Presence {
            user_id: user_id.clone(),
            username: username.to_string(),
            status: PresenceStatus::Offline,
            room_id,
        };
        match except {
            Some(conn_id) => broadcast::to_all_except(&self.registry, &offline, conn_id),
            None => broadcast::to_all(&self.registry, &offline),
        };
    }
}
