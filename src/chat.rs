//! Chat broadcast handler
//!
//! `chat` is checked against the sender's room, persisted, and only then
//! fanned out to the whole room (sender included) and acknowledged to the
//! sender. Edits and deletions are authorized by the store against the
//! persisted author. Reactions are relayed without persistence.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::broadcast;
use crate::error::{AppError, StoreError};
use crate::message::{ChatBroadcast, ChatPayload, ServerMessage};
use crate::server::{ChatServer, HandlerResult, StoreJob};
use crate::store::{NewMessage, StoredMessage};
use crate::types::{ConnId, MessageId, RoomId, UserId};

impl ChatServer {
    /// Identity of a connection that must currently be in `room_id`
    fn member_of(&self, conn_id: ConnId, room_id: RoomId) -> Result<(UserId, String), AppError> {
        let identity = self.identity(conn_id)?;
        let current = self.registry.state(conn_id).and_then(|state| state.room_id);
        if current != Some(room_id) {
            return Err(AppError::WrongRoom);
        }
        Ok(identity)
    }

    pub(crate) fn handle_chat(&mut self, conn_id: ConnId, payload: ChatPayload) -> HandlerResult {
        let (user_id, username) = self.member_of(conn_id, payload.room_id)?;
        if payload.user_id.as_ref().is_some_and(|claimed| claimed != &user_id) {
            return Err(AppError::InvalidSender);
        }

        Ok(Some(StoreJob::Insert {
            message: NewMessage {
                room_id: payload.room_id,
                user_id,
                content: payload.content,
                kind: payload.kind,
                attachment: payload.attachment,
            },
            username,
        }))
    }

    /// Fan out a persisted chat message, or report the store failure
    pub(crate) fn finish_chat(
        &mut self,
        conn_id: ConnId,
        result: Result<StoredMessage, StoreError>,
        username: String,
    ) {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                warn!("Chat from {} not stored: {}", conn_id, e);
                broadcast::to_conn(
                    &self.registry,
                    conn_id,
                    &ServerMessage::error(e.into_app_error("send")),
                );
                return;
            }
        };

        let message_id = message.id;
        let room_id = message.room_id;

        // Sending a message ends the sender's typing state
        self.stop_typing_in(&message.user_id, &username, room_id);

        self.registry.note_live(room_id, message_id);
        let delivered = broadcast::to_room(
            &self.registry,
            room_id,
            &ServerMessage::Chat(ChatBroadcast { message, username }),
        );
        info!("Message {} delivered to {} connections in room {}", message_id, delivered, room_id);

        broadcast::to_conn(&self.registry, conn_id, &ServerMessage::ChatSent { message_id });
    }

    pub(crate) fn handle_message_edit(
        &mut self,
        conn_id: ConnId,
        message_id: MessageId,
        room_id: RoomId,
        content: String,
    ) -> HandlerResult {
        let (user_id, _) = self.member_of(conn_id, room_id)?;
        Ok(Some(StoreJob::Edit {
            message_id,
            room_id,
            user_id,
            content,
        }))
    }

    pub(crate) fn finish_message_edit(
        &mut self,
        conn_id: ConnId,
        message_id: MessageId,
        room_id: RoomId,
        content: String,
        result: Result<DateTime<Utc>, StoreError>,
    ) {
        match result {
            Ok(edited_at) => {
                broadcast::to_room(
                    &self.registry,
                    room_id,
                    &ServerMessage::MessageEdited {
                        message_id,
                        room_id,
                        content,
                        edited_at,
                    },
                );
            }
            Err(e) => {
                warn!("Edit of message {} by {} refused: {}", message_id, conn_id, e);
                broadcast::to_conn(
                    &self.registry,
                    conn_id,
                    &ServerMessage::error(e.into_app_error("edit")),
                );
            }
        }
    }

    pub(crate) fn handle_message_delete(
        &mut self,
        conn_id: ConnId,
        message_id: MessageId,
        room_id: RoomId,
    ) -> HandlerResult {
        let (user_id, _) = self.member_of(conn_id, room_id)?;
        Ok(Some(StoreJob::Delete {
            message_id,
            room_id,
            user_id,
        }))
    }

    pub(crate) fn finish_message_delete(
        &mut self,
        conn_id: ConnId,
        message_id: MessageId,
        room_id: RoomId,
        result: Result<(), StoreError>,
    ) {
        match result {
            Ok(()) => {
                broadcast::to_room(
                    &self.registry,
                    room_id,
                    &ServerMessage::MessageDeleted {
                        message_id,
                        room_id,
                    },
                );
            }
            Err(e) => {
                warn!("Delete of message {} by {} refused: {}", message_id, conn_id, e);
                broadcast::to_conn(
                    &self.registry,
                    conn_id,
                    &ServerMessage::error(e.into_app_error("delete")),
                );
            }
        }
    }

    pub(crate) fn handle_message_reaction(
        &mut self,
        conn_id: ConnId,
        message_id: MessageId,
        room_id: RoomId,
        reaction: String,
    ) -> HandlerResult {
        let (user_id, username) = self.identity(conn_id)?;
        broadcast::to_room(
            &self.registry,
            room_id,
            &ServerMessage::MessageReaction {
                message_id,
                room_id,
                reaction,
                user_id,
                username,
            },
        );
        Ok(None)
    }
}
