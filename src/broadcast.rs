//! Broadcast router
//!
//! Stateless fan-out over the [`ConnectionRegistry`]. Each call serializes
//! the message once and queues the same frame on every target. A target
//! whose queue is closed or full is logged and skipped; delivery to the
//! remaining targets continues.

use std::sync::Arc;

use tracing::{error, warn};

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::registry::{ConnectionRegistry, Outbound};
use crate::types::{ConnId, RoomId, UserId};

fn encode(msg: &ServerMessage) -> Option<Arc<str>> {
    match msg.encode() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            None
        }
    }
}

fn push(registry: &ConnectionRegistry, conn_id: ConnId, frame: &Arc<str>) -> Result<(), SendError> {
    let sender = registry
        .sender(conn_id)
        .ok_or(SendError::UnknownConnection)?;
    sender
        .try_send(Arc::clone(frame))
        .map_err(|e| match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => SendError::ChannelClosed,
        })
}

fn fan_out(
    registry: &ConnectionRegistry,
    targets: impl IntoIterator<Item = ConnId>,
    msg: &ServerMessage,
) -> usize {
    let Some(frame) = encode(msg) else {
        return 0;
    };

    let mut delivered = 0;
    for conn_id in targets {
        match push(registry, conn_id, &frame) {
            Ok(()) => delivered += 1,
            Err(e) => warn!("Dropped frame for {}: {}", conn_id, e),
        }
    }
    delivered
}

/// Send to a single connection
pub fn to_conn(registry: &ConnectionRegistry, conn_id: ConnId, msg: &ServerMessage) -> bool {
    fan_out(registry, [conn_id], msg) == 1
}

/// Send to every member of a room
pub fn to_room(registry: &ConnectionRegistry, room_id: RoomId, msg: &ServerMessage) -> usize {
    fan_out(registry, registry.room_members(room_id), msg)
}

/// Send to every member of a room except one connection
pub fn to_room_except(
    registry: &ConnectionRegistry,
    room_id: RoomId,
    msg: &ServerMessage,
    except: ConnId,
) -> usize {
    let targets = registry
        .room_members(room_id)
        .into_iter()
        .filter(|conn_id| *conn_id != except);
    fan_out(registry, targets, msg)
}

/// Send to the connection currently mapped to `user_id`
pub fn to_user(registry: &ConnectionRegistry, user_id: &UserId, msg: &ServerMessage) -> bool {
    match registry.user_connection(user_id) {
        Some(conn_id) => to_conn(registry, conn_id, msg),
        None => false,
    }
}

/// Send to every live connection
pub fn to_all(registry: &ConnectionRegistry, msg: &ServerMessage) -> usize {
    let targets: Vec<ConnId> = registry.all_connections().collect();
    fan_out(registry, targets, msg)
}

/// Send to every live connection except one
pub fn to_all_except(registry: &ConnectionRegistry, msg: &ServerMessage, except: ConnId) -> usize {
    let targets: Vec<ConnId> = registry
        .all_connections()
        .filter(|conn_id| *conn_id != except)
        .collect();
    fan_out(registry, targets, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{connection_link, StateUpdate};
    use tokio::sync::mpsc;

    fn frame_type(frame: Outbound) -> String {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    fn join(
        registry: &mut ConnectionRegistry,
        user: &str,
        room: i64,
        capacity: usize,
    ) -> (ConnId, mpsc::Receiver<Outbound>) {
        let (link, rx) = connection_link(capacity);
        let conn_id = ConnId::new();
        registry.add(
            conn_id,
            link,
            StateUpdate {
                user_id: Some(UserId::from(user)),
                username: Some(user.to_string()),
            },
        );
        registry.join_room(conn_id, RoomId(room));
        (conn_id, rx.frames)
    }

    #[tokio::test]
    async fn test_room_fan_out_excludes_sender() {
        let mut registry = ConnectionRegistry::new();
        let (a, mut rx_a) = join(&mut registry, "a", 1, 8);
        let (_b, mut rx_b) = join(&mut registry, "b", 1, 8);
        let (_c, mut rx_c) = join(&mut registry, "c", 2, 8);

        let sent = to_room_except(&registry, RoomId(1), &ServerMessage::Ping {}, a);
        assert_eq!(sent, 1);
        assert_eq!(frame_type(rx_b.recv().await.unwrap()), "ping");
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());

        assert_eq!(to_room(&registry, RoomId(1), &ServerMessage::Ping {}), 2);
        assert_eq!(to_all(&registry, &ServerMessage::Ping {}), 3);
        assert_eq!(to_all_except(&registry, &ServerMessage::Ping {}, a), 2);
    }

    #[tokio::test]
    async fn test_broken_target_does_not_stop_delivery() {
        let mut registry = ConnectionRegistry::new();
        let (_dead, rx_dead) = join(&mut registry, "dead", 1, 8);
        let (_full, _rx_full) = join(&mut registry, "full", 1, 1);
        let (_ok, mut rx_ok) = join(&mut registry, "ok", 1, 8);
        drop(rx_dead);

        // Fill the single-slot queue
        to_user(&registry, &UserId::from("full"), &ServerMessage::Ping {});

        let sent = to_room(&registry, RoomId(1), &ServerMessage::Ping {});
        assert_eq!(sent, 1);
        assert_eq!(frame_type(rx_ok.recv().await.unwrap()), "ping");
    }

    #[tokio::test]
    async fn test_to_user_unknown() {
        let registry = ConnectionRegistry::new();
        assert!(!to_user(&registry, &UserId::from("nobody"), &ServerMessage::Ping {}));
    }
}
