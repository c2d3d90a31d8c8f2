//! ChatServer Actor implementation
//!
//! The central actor that owns all relay state: the connection registry,
//! typing timers and call sessions. Connection tasks, timers and store
//! jobs talk to it through one mpsc command channel, so the three maps are
//! only ever touched from this task and need no locks.
//!
//! Store calls never run on the actor. A handler that needs the store
//! returns a [`StoreJob`]; the job runs in its own task and posts a
//! [`ServerCommand::StoreResult`] back. The frame's completion signal is
//! carried along, so the connection does not submit its next frame until
//! the current one is fully handled.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broadcast;
use crate::call::CallBook;
use crate::config::Config;
use crate::error::{AppError, StoreError};
use crate::liveness;
use crate::message::{ChatBroadcast, ClientMessage, ServerMessage};
use crate::registry::{ConnectionLink, ConnectionRegistry, StateUpdate};
use crate::store::{MessageStore, NewMessage, StoredMessage};
use crate::typing::{TypingKey, TypingTracker};
use crate::types::{ConnId, MessageId, RoomId, UserId};

/// Completion signal for one inbound frame
pub type Ack = Option<oneshot::Sender<()>>;

pub(crate) fn ack(done: Ack) {
    if let Some(done) = done {
        let _ = done.send(());
    }
}

/// Commands sent to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection accepted
    Connect { conn_id: ConnId, link: ConnectionLink },
    /// Transport closed
    Disconnect { conn_id: ConnId },
    /// Decoded inbound frame
    Frame {
        conn_id: ConnId,
        message: ClientMessage,
        done: Ack,
    },
    /// A store job finished
    StoreResult {
        conn_id: ConnId,
        outcome: StoreOutcome,
        done: Ack,
    },
    /// A typing timer ran out
    TypingExpired { key: TypingKey, generation: u64 },
    /// Heartbeat tick: evict stale connections, ping the rest
    Heartbeat,
    /// Snapshot of the relay's counters
    Stats { reply: oneshot::Sender<ServerStats> },
}

/// Counters reported by [`ServerCommand::Stats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: usize,
    pub active_rooms: Vec<RoomId>,
    /// Member connections per active room
    pub room_connections: Vec<(RoomId, usize)>,
    pub call_sessions: usize,
    pub active_calls: usize,
    pub typing: usize,
}

/// Store work deferred off the actor
#[derive(Debug)]
pub enum StoreJob {
    /// Resolve a display name for a presence without one
    LookupName { user_id: UserId },
    /// Persist a chat message
    Insert {
        message: NewMessage,
        username: String,
    },
    Edit {
        message_id: MessageId,
        room_id: RoomId,
        user_id: UserId,
        content: String,
    },
    Delete {
        message_id: MessageId,
        room_id: RoomId,
        user_id: UserId,
    },
    /// Load the recent history of a room just joined
    History { room_id: RoomId },
}

/// Result of a [`StoreJob`], applied back on the actor
#[derive(Debug)]
pub enum StoreOutcome {
    NameResolved {
        user_id: UserId,
        username: Option<String>,
    },
    ChatStored {
        result: Result<StoredMessage, StoreError>,
        username: String,
    },
    Edited {
        message_id: MessageId,
        room_id: RoomId,
        content: String,
        result: Result<DateTime<Utc>, StoreError>,
    },
    Deleted {
        message_id: MessageId,
        room_id: RoomId,
        result: Result<(), StoreError>,
    },
    History {
        room_id: RoomId,
        result: Result<Vec<ChatBroadcast>, StoreError>,
    },
}

impl StoreJob {
    async fn run(self, store: &dyn MessageStore, history_limit: usize) -> StoreOutcome {
        match self {
            StoreJob::LookupName { user_id } => {
                let username = match store.display_name(&user_id).await {
                    Ok(name) => name,
                    Err(e) => {
                        warn!("Display name lookup for {} failed: {}", user_id, e);
                        None
                    }
                };
                StoreOutcome::NameResolved { user_id, username }
            }
            StoreJob::Insert { message, username } => StoreOutcome::ChatStored {
                result: store.insert(message).await,
                username,
            },
            StoreJob::Edit {
                message_id,
                room_id,
                user_id,
                content,
            } => {
                let result = store.mark_edited(message_id, &user_id, &content).await;
                StoreOutcome::Edited {
                    message_id,
                    room_id,
                    content,
                    result,
                }
            }
            StoreJob::Delete {
                message_id,
                room_id,
                user_id,
            } => StoreOutcome::Deleted {
                message_id,
                room_id,
                result: store.mark_deleted(message_id, &user_id).await,
            },
            StoreJob::History { room_id } => {
                let result = match store.recent_by_room(room_id, history_limit).await {
                    Ok(messages) => Ok(with_display_names(store, messages).await),
                    Err(e) => Err(e),
                };
                StoreOutcome::History { room_id, result }
            }
        }
    }
}

/// Attach author display names to history rows, one lookup per author
async fn with_display_names(
    store: &dyn MessageStore,
    messages: Vec<StoredMessage>,
) -> Vec<ChatBroadcast> {
    let mut names: HashMap<UserId, String> = HashMap::new();
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if !names.contains_key(&message.user_id) {
            let name = store
                .display_name(&message.user_id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| message.user_id.to_string());
            names.insert(message.user_id.clone(), name);
        }
        let username = names
            .get(&message.user_id)
            .cloned()
            .unwrap_or_default();
        out.push(ChatBroadcast { message, username });
    }
    out
}

/// The main ChatServer actor
pub struct ChatServer {
    pub(crate) config: Config,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) typing: TypingTracker,
    pub(crate) calls: CallBook,
    store: Arc<dyn MessageStore>,
    receiver: mpsc::Receiver<ServerCommand>,
    /// Weak handle to our own channel, for timers and store jobs
    pub(crate) handle: mpsc::WeakSender<ServerCommand>,
}

impl ChatServer {
    /// Create a ChatServer and the sender used to reach it
    ///
    /// The actor stops once every clone of the returned sender is gone.
    pub fn new(
        config: Config,
        store: Arc<dyn MessageStore>,
    ) -> (Self, mpsc::Sender<ServerCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let server = Self {
            typing: TypingTracker::new(config.typing_timeout()),
            registry: ConnectionRegistry::new(),
            calls: CallBook::new(),
            store,
            receiver: cmd_rx,
            handle: cmd_tx.downgrade(),
            config,
        };
        (server, cmd_tx)
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all senders are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");
        let heartbeat =
            liveness::spawn_heartbeat(self.config.heartbeat_interval(), self.handle.clone());

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        heartbeat.abort();
        info!("ChatServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect { conn_id, link } => {
                self.handle_connect(conn_id, link);
            }
            ServerCommand::Disconnect { conn_id } => {
                self.handle_disconnect(conn_id);
            }
            ServerCommand::Frame {
                conn_id,
                message,
                done,
            } => {
                self.handle_frame(conn_id, message, done);
            }
            ServerCommand::StoreResult {
                conn_id,
                outcome,
                done,
            } => {
                self.handle_store_result(conn_id, outcome);
                ack(done);
            }
            ServerCommand::TypingExpired { key, generation } => {
                self.handle_typing_expired(key, generation);
            }
            ServerCommand::Heartbeat => {
                self.handle_heartbeat();
            }
            ServerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Handle new connection
    fn handle_connect(&mut self, conn_id: ConnId, link: ConnectionLink) {
        self.registry.add(conn_id, link, StateUpdate::default());
        broadcast::to_conn(
            &self.registry,
            conn_id,
            &ServerMessage::Connected {
                message: "Connected to chat server".to_string(),
                connection_id: conn_id,
                server_time: Utc::now(),
            },
        );
        info!("Connection {} registered", conn_id);
        debug!(
            "Total connections: {}, Active rooms: {}",
            self.registry.total_connections(),
            self.registry.active_rooms().len()
        );
    }

    /// Validate-and-dispatch for one inbound frame
    fn handle_frame(&mut self, conn_id: ConnId, message: ClientMessage, done: Ack) {
        if self.registry.state(conn_id).is_none() {
            debug!("Dropping frame from unregistered connection {}", conn_id);
            ack(done);
            return;
        }
        self.registry.touch(conn_id);

        let kind = message.kind();
        debug!("{} from {}", kind, conn_id);

        let result = match message {
            ClientMessage::Presence(payload) => self.handle_presence(conn_id, payload),
            ClientMessage::JoinRoom { room_id } => self.handle_join_room(conn_id, room_id),
            ClientMessage::LeaveRoom {} => self.handle_leave_room(conn_id),
            ClientMessage::Chat(payload) => self.handle_chat(conn_id, payload),
            ClientMessage::MessageEdit {
                message_id,
                room_id,
                content,
            } => self.handle_message_edit(conn_id, message_id, room_id, content),
            ClientMessage::MessageDelete {
                message_id,
                room_id,
            } => self.handle_message_delete(conn_id, message_id, room_id),
            ClientMessage::MessageReaction {
                message_id,
                room_id,
                reaction,
            } => self.handle_message_reaction(conn_id, message_id, room_id, reaction),
            ClientMessage::Typing { room_id, is_typing } => {
                self.handle_typing(conn_id, room_id, is_typing)
            }
            ClientMessage::Webrtc(signal) => self.handle_webrtc(conn_id, signal),
            ClientMessage::CallEnd { .. } => self.handle_call_end(conn_id),
            ClientMessage::CallReject { caller_id } => self.handle_call_reject(conn_id, caller_id),
            ClientMessage::Pong {} => Ok(None),
        };

        match result {
            Ok(Some(job)) => self.spawn_store_job(conn_id, job, done),
            Ok(None) => ack(done),
            Err(e) => {
                warn!("Rejected {} from {}: {}", kind, conn_id, e);
                broadcast::to_conn(&self.registry, conn_id, &ServerMessage::error(e));
                ack(done);
            }
        }
    }

    fn spawn_store_job(&self, conn_id: ConnId, job: StoreJob, done: Ack) {
        let store = Arc::clone(&self.store);
        let notify = self.handle.clone();
        let history_limit = self.config.history_limit;

        tokio::spawn(async move {
            let outcome = job.run(store.as_ref(), history_limit).await;
            match notify.upgrade() {
                Some(tx) => {
                    if tx
                        .send(ServerCommand::StoreResult {
                            conn_id,
                            outcome,
                            done,
                        })
                        .await
                        .is_err()
                    {
                        debug!("Server closed before store result for {}", conn_id);
                    }
                }
                None => debug!("Server gone, dropping store result for {}", conn_id),
            }
        });
    }

    fn handle_store_result(&mut self, conn_id: ConnId, outcome: StoreOutcome) {
        match outcome {
            StoreOutcome::NameResolved { user_id, username } => {
                let username = username.unwrap_or_else(|| user_id.to_string());
                self.identify(conn_id, user_id, username);
            }
            StoreOutcome::ChatStored { result, username } => {
                self.finish_chat(conn_id, result, username);
            }
            StoreOutcome::Edited {
                message_id,
                room_id,
                content,
                result,
            } => self.finish_message_edit(conn_id, message_id, room_id, content, result),
            StoreOutcome::Deleted {
                message_id,
                room_id,
                result,
            } => self.finish_message_delete(conn_id, message_id, room_id, result),
            StoreOutcome::History { room_id, result } => {
                self.replay_history(conn_id, room_id, result);
            }
        }
    }

    fn stats(&self) -> ServerStats {
        let active_rooms = self.registry.active_rooms();
        let room_connections = active_rooms
            .iter()
            .map(|room_id| (*room_id, self.registry.room_connection_count(*room_id)))
            .collect();
        ServerStats {
            connections: self.registry.total_connections(),
            active_rooms,
            room_connections,
            call_sessions: self.calls.len(),
            active_calls: self.calls.active_count(),
            typing: self.typing.len(),
        }
    }

    /// Identity of a connection, or `IdentityRequired`
    pub(crate) fn identity(&self, conn_id: ConnId) -> Result<(UserId, String), AppError> {
        let state = self.registry.state(conn_id).ok_or(AppError::IdentityRequired)?;
        let user_id = state.user_id.clone().ok_or(AppError::IdentityRequired)?;
        Ok((user_id, state.display_name().to_string()))
    }
}

/// Handler result: `Some(job)` defers completion to a store job
pub(crate) type HandlerResult = Result<Option<StoreJob>, AppError>;
