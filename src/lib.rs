//! Real-time chat and call-signaling relay
//!
//! A WebSocket relay built with tokio-tungstenite using the Actor pattern
//! for state management.
//!
//! # Features
//! - Presence announcements and online-user snapshots
//! - Room membership with history replay on join
//! - Persisted chat with edits, deletions and reactions
//! - Debounced typing indicators that expire on their own
//! - WebRTC offer/answer/ICE relay with per-pair call sessions
//! - Heartbeat pings and eviction of silent connections
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `ChatServer` owns the connection registry, typing timers and calls
//! - Each connection has a `handler` task communicating with the server
//! - Persistence runs in spawned tasks behind the `MessageStore` trait
//! - No locks needed - all relay state goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use chat_relay::{handle_connection, ChatServer, Config, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let listener = TcpListener::bind(&config.bind).await.unwrap();
//!     let buffer = config.outbound_buffer;
//!     let (server, cmd_tx) = ChatServer::new(config, Arc::new(MemoryStore::new()));
//!     tokio::spawn(server.run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, cmd_tx.clone(), buffer));
//!     }
//! }
//! ```

pub mod broadcast;
pub mod call;
pub mod chat;
pub mod config;
pub mod error;
pub mod handler;
pub mod liveness;
pub mod message;
pub mod presence;
pub mod registry;
pub mod server;
pub mod store;
pub mod types;
pub mod typing;

// Re-export main types for convenience
pub use call::{CallBook, CallSession, CallStatus};
pub use config::Config;
pub use error::{AppError, SendError, StoreError};
pub use handler::handle_connection;
pub use message::{decode, ClientMessage, ErrorCode, ServerMessage};
pub use registry::{
    connection_link, ConnectionLink, ConnectionRegistry, ConnectionState, LinkReceiver, Outbound,
};
pub use server::{ChatServer, ServerCommand, ServerStats};
pub use store::{MemoryStore, MessageStore, StoredMessage};
pub use types::{ConnId, MessageId, RoomId, UserId};
