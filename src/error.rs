//! Error types for the relay
//!
//! Defines application-level errors, delivery errors and the errors
//! reported by the external message store.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (send an `error` frame to the client, state untouched).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Frame is not a `{type, payload, timestamp}` envelope
    #[error("Invalid message format")]
    InvalidFormat,

    /// Envelope carries a type the relay does not handle
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Known type, but the payload does not match its shape
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// Action requires a prior `presence` announcement
    #[error("Authentication required")]
    IdentityRequired,

    /// Connection is not in any room
    #[error("Not in room")]
    NotInRoom,

    /// Payload room differs from the connection's room
    #[error("Not in this room")]
    WrongRoom,

    /// Payload names a user other than the connection's identity
    #[error("Invalid sender")]
    InvalidSender,

    /// Store row does not exist (or is already deleted)
    #[error("Message not found")]
    MessageNotFound,

    /// Store row belongs to another author
    #[error("Not the message author")]
    NotMessageAuthor,

    /// Store could not complete the named operation
    #[error("Store failure during {0}")]
    StoreFailed(&'static str),
}

/// Message send errors
///
/// Occurs when attempting to push a frame to a connection that is gone
/// or whose outbound queue is full.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The connection is not draining its queue fast enough
    #[error("Outbound queue full")]
    QueueFull,

    /// The connection is not registered
    #[error("Unknown connection")]
    UnknownConnection,
}

/// Errors reported by a [`MessageStore`](crate::store::MessageStore)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message not found")]
    NotFound,

    #[error("message belongs to another user")]
    Forbidden,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Map a store failure into the business error reported to the client
    pub fn into_app_error(self, operation: &'static str) -> AppError {
        match self {
            StoreError::NotFound => AppError::MessageNotFound,
            StoreError::Forbidden => AppError::NotMessageAuthor,
            StoreError::Unavailable(_) => AppError::StoreFailed(operation),
        }
    }
}
