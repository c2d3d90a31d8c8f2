//! Typing indicator debouncer
//!
//! One expiry timer per (user, room). A repeated "typing started" replaces
//! the timer instead of stacking a second one. When a timer fires it posts
//! [`ServerCommand::TypingExpired`] back to the server actor; the generation
//! number in that command lets the actor ignore a timer that was replaced
//! or cancelled after it had already fired.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::broadcast;
use crate::message::ServerMessage;
use crate::server::{ChatServer, HandlerResult, ServerCommand};
use crate::types::{ConnId, RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypingKey {
    pub user_id: UserId,
    pub room_id: RoomId,
}

impl TypingKey {
    pub fn new(user_id: UserId, room_id: RoomId) -> Self {
        Self { user_id, room_id }
    }
}

#[derive(Debug)]
struct TypingTimer {
    generation: u64,
    conn_id: ConnId,
    username: String,
    handle: AbortHandle,
}

/// A typing state that ran out without a "typing stopped"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredTyping {
    pub key: TypingKey,
    /// Connection that started typing (excluded from the broadcast)
    pub conn_id: ConnId,
    pub username: String,
}

/// Live typing timers, keyed by (user, room)
#[derive(Debug)]
pub struct TypingTracker {
    timers: HashMap<TypingKey, TypingTimer>,
    next_generation: u64,
    window: Duration,
}

impl TypingTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            timers: HashMap::new(),
            next_generation: 0,
            window,
        }
    }

    /// Start (or restart) the expiry timer for `key`
    pub fn start(
        &mut self,
        key: TypingKey,
        conn_id: ConnId,
        username: String,
        notify: &mpsc::WeakSender<ServerCommand>,
    ) {
        self.stop(&key);

        self.next_generation += 1;
        let generation = self.next_generation;
        let window = self.window;
        let notify = notify.clone();
        let expired_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(tx) = notify.upgrade() {
                let _ = tx
                    .send(ServerCommand::TypingExpired {
                        key: expired_key,
                        generation,
                    })
                    .await;
            }
        })
        .abort_handle();

        self.timers.insert(
            key,
            TypingTimer {
                generation,
                conn_id,
                username,
                handle,
            },
        );
    }

    /// Cancel and forget the timer for `key`; false if there was none
    pub fn stop(&mut self, key: &TypingKey) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fired timer
    ///
    /// Returns `None` when the timer for `key` has since been replaced or
    /// cancelled.
    pub fn expire(&mut self, key: &TypingKey, generation: u64) -> Option<ExpiredTyping> {
        if self.timers.get(key)?.generation != generation {
            trace!("Ignoring superseded typing timer for {}", key.user_id);
            return None;
        }
        let timer = self.timers.remove(key)?;
        Some(ExpiredTyping {
            key: key.clone(),
            conn_id: timer.conn_id,
            username: timer.username,
        })
    }

    /// Cancel every timer of a user, returning the affected rooms
    pub fn clear_user(&mut self, user_id: &UserId) -> Vec<RoomId> {
        let keys: Vec<TypingKey> = self
            .timers
            .keys()
            .filter(|key| &key.user_id == user_id)
            .cloned()
            .collect();

        let mut rooms: Vec<RoomId> = keys
            .into_iter()
            .filter(|key| self.stop(key))
            .map(|key| key.room_id)
            .collect();
        rooms.sort();
        rooms
    }

    /// Users currently typing in a room, with their display names
    pub fn typing_users(&self, room_id: RoomId) -> Vec<(UserId, String)> {
        let mut users: Vec<(UserId, String)> = self
            .timers
            .iter()
            .filter(|(key, _)| key.room_id == room_id)
            .map(|(key, timer)| (key.user_id.clone(), timer.username.clone()))
            .collect();
        users.sort();
        users
    }

    pub fn is_typing(&self, key: &TypingKey) -> bool {
        self.timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        for timer in self.timers.values() {
            timer.handle.abort();
        }
    }
}

fn typing_frame(key: &TypingKey, username: &str, is_typing: bool) -> ServerMessage {
    ServerMessage::Typing {
        room_id: key.room_id,
        user_id: key.user_id.clone(),
        username: username.to_string(),
        is_typing,
    }
}

impl ChatServer {
    /// `typing` frames for a room other than the sender's are ignored
    pub(crate) fn handle_typing(
        &mut self,
        conn_id: ConnId,
        room_id: RoomId,
        is_typing: bool,
    ) -> HandlerResult {
        let Ok((user_id, username)) = self.identity(conn_id) else {
            return Ok(None);
        };
        let current = self.registry.state(conn_id).and_then(|state| state.room_id);
        if current != Some(room_id) {
            debug!("Ignoring typing for room {} from {} (in {:?})", room_id, user_id, current);
            return Ok(None);
        }

        let key = TypingKey::new(user_id, room_id);
        if is_typing {
            self.typing
                .start(key.clone(), conn_id, username.clone(), &self.handle);
        } else {
            self.typing.stop(&key);
        }

        broadcast::to_room_except(
            &self.registry,
            room_id,
            &typing_frame(&key, &username, is_typing),
            conn_id,
        );
        Ok(None)
    }

    pub(crate) fn handle_typing_expired(&mut self, key: TypingKey, generation: u64) {
        let Some(expired) = self.typing.expire(&key, generation) else {
            return;
        };
        debug!("Typing of {} in room {} expired", key.user_id, key.room_id);
        broadcast::to_room_except(
            &self.registry,
            key.room_id,
            &typing_frame(&key, &expired.username, false),
            expired.conn_id,
        );
    }

    /// Clear a live typing state in one room, telling the room
    pub(crate) fn stop_typing_in(&mut self, user_id: &UserId, username: &str, room_id: RoomId) {
        let key = TypingKey::new(user_id.clone(), room_id);
        if self.typing.stop(&key) {
            broadcast::to_room(&self.registry, room_id, &typing_frame(&key, username, false));
        }
    }

    /// Clear every typing state of a user going offline
    pub(crate) fn clear_typing(&mut self, user_id: &UserId, username: &str) {
        for room_id in self.typing.clear_user(user_id) {
            let key = TypingKey::new(user_id.clone(), room_id);
            broadcast::to_room(&self.registry, room_id, &typing_frame(&key, username, false));
        }
    }
}
