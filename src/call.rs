//! Call session state machine
//!
//! One session per unordered pair of users: `pending` on offer, `active`
//! on the matching answer, removed once ended or rejected. Sessions hold
//! user ids only; reaching a participant goes back through the registry.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::broadcast;
use crate::error::AppError;
use crate::message::{ServerMessage, SignalKind, WebRtcSignal};
use crate::server::{ChatServer, HandlerResult};
use crate::types::{ConnId, RoomId, UserId};

/// `webrtc_error` reason when the target has no live connection
pub const UNAVAILABLE_REASON: &str = "User not available";

/// `call_ended` reason for an explicit hang-up
pub const HANGUP_REASON: &str = "User ended call";

/// Lookup key for a pair of participants, independent of direction
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey(UserId, UserId);

impl CallKey {
    /// Build the key, sorting the two ids
    pub fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn involves(&self, user_id: &UserId) -> bool {
        &self.0 == user_id || &self.1 == user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Pending,
    Active,
    Ended,
}

/// A pairwise call negotiation
#[derive(Debug, Clone)]
pub struct CallSession {
    pub caller_id: UserId,
    pub callee_id: UserId,
    /// Caller's room at offer time (informational)
    pub room_id: Option<RoomId>,
    pub started_at: Instant,
    pub status: CallStatus,
}

impl CallSession {
    /// The participant that is not `user_id`
    pub fn counterpart(&self, user_id: &UserId) -> &UserId {
        if &self.caller_id == user_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }

    pub fn involves(&self, user_id: &UserId) -> bool {
        &self.caller_id == user_id || &self.callee_id == user_id
    }
}

/// All live call sessions
#[derive(Debug, Default)]
pub struct CallBook {
    sessions: HashMap<CallKey, CallSession>,
}

impl CallBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending session, replacing any session the pair already had
    pub fn offer(
        &mut self,
        caller_id: &UserId,
        callee_id: &UserId,
        room_id: Option<RoomId>,
    ) -> Option<CallSession> {
        let session = CallSession {
            caller_id: caller_id.clone(),
            callee_id: callee_id.clone(),
            room_id,
            started_at: Instant::now(),
            status: CallStatus::Pending,
        };
        self.sessions.insert(CallKey::new(caller_id, callee_id), session)
    }

    /// Activate the pending session of the pair
    ///
    /// Returns the session only on the pending → active transition, so a
    /// repeated answer activates nothing.
    pub fn answer(&mut self, answerer: &UserId, caller: &UserId) -> Option<CallSession> {
        let session = self.sessions.get_mut(&CallKey::new(caller, answerer))?;
        if session.status != CallStatus::Pending {
            return None;
        }
        session.status = CallStatus::Active;
        Some(session.clone())
    }

    /// Remove the pending session the callee declines
    pub fn reject(&mut self, callee: &UserId, caller: &UserId) -> Option<CallSession> {
        let key = CallKey::new(caller, callee);
        if self.sessions.get(&key)?.status != CallStatus::Pending {
            return None;
        }
        self.sessions.remove(&key).map(|mut session| {
            session.status = CallStatus::Ended;
            session
        })
    }

    /// End and remove every session (pending or active) involving `user_id`
    pub fn end_all(&mut self, user_id: &UserId) -> Vec<CallSession> {
        let keys: Vec<CallKey> = self
            .sessions
            .keys()
            .filter(|key| key.involves(user_id))
            .cloned()
            .collect();

        keys.into_iter()
            .filter_map(|key| self.sessions.remove(&key))
            .map(|mut session| {
                session.status = CallStatus::Ended;
                session
            })
            .collect()
    }

    pub fn get(&self, a: &UserId, b: &UserId) -> Option<&CallSession> {
        self.sessions.get(&CallKey::new(a, b))
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.status == CallStatus::Active)
            .count()
    }

    /// The active call `user_id` takes part in, if any
    pub fn active_call_of(&self, user_id: &UserId) -> Option<&CallSession> {
        self.sessions
            .values()
            .find(|s| s.status == CallStatus::Active && s.involves(user_id))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl ChatServer {
    /// Relay an offer/answer/ICE candidate and drive the session state
    pub(crate) fn handle_webrtc(&mut self, conn_id: ConnId, signal: WebRtcSignal) -> HandlerResult {
        let (user_id, username) = self.identity(conn_id)?;
        if signal.from_user_id != user_id {
            return Err(AppError::InvalidSender);
        }

        let Some(target) = self.registry.user_connection(&signal.to_user_id) else {
            debug!("{:?} from {} to unreachable {}", signal.kind, user_id, signal.to_user_id);
            broadcast::to_conn(
                &self.registry,
                conn_id,
                &ServerMessage::WebrtcError {
                    reason: UNAVAILABLE_REASON.to_string(),
                    to_user_id: signal.to_user_id,
                },
            );
            return Ok(None);
        };

        match signal.kind {
            SignalKind::Offer => {
                let room_id = self.registry.state(conn_id).and_then(|state| state.room_id);
                if self.calls.offer(&user_id, &signal.to_user_id, room_id).is_some() {
                    debug!("Offer from {} replaced a session with {}", user_id, signal.to_user_id);
                }
                info!("Call offer {} -> {}", user_id, signal.to_user_id);
                broadcast::to_conn(
                    &self.registry,
                    target,
                    &ServerMessage::IncomingCall {
                        from_user_id: user_id,
                        from_username: username,
                    },
                );
            }
            SignalKind::Answer => {
                if let Some(session) = self.calls.answer(&user_id, &signal.to_user_id) {
                    info!("Call {} <-> {} active", session.caller_id, session.callee_id);
                    let active = ServerMessage::CallActive {
                        caller_id: session.caller_id.clone(),
                        callee_id: session.callee_id.clone(),
                    };
                    broadcast::to_user(&self.registry, &session.caller_id, &active);
                    broadcast::to_user(&self.registry, &session.callee_id, &active);
                }
            }
            SignalKind::IceCandidate => {}
        }

        broadcast::to_conn(&self.registry, target, &ServerMessage::Webrtc(signal));
        Ok(None)
    }

    pub(crate) fn handle_call_end(&mut self, conn_id: ConnId) -> HandlerResult {
        let (user_id, _) = self.identity(conn_id)?;
        self.end_calls(&user_id, HANGUP_REASON);
        Ok(None)
    }

    pub(crate) fn handle_call_reject(
        &mut self,
        conn_id: ConnId,
        caller_id: UserId,
    ) -> HandlerResult {
        let (user_id, username) = self.identity(conn_id)?;
        let Some(session) = self.calls.reject(&user_id, &caller_id) else {
            debug!("No pending call from {} to {} to reject", caller_id, user_id);
            return Ok(None);
        };

        info!("Call {} -> {} rejected", session.caller_id, session.callee_id);
        broadcast::to_user(
            &self.registry,
            &session.caller_id,
            &ServerMessage::CallRejected {
                rejected_by: user_id,
                username,
            },
        );
        Ok(None)
    }

    /// End every session of a user, telling each counterpart why
    pub(crate) fn end_calls(&mut self, user_id: &UserId, reason: &str) {
        for session in self.calls.end_all(user_id) {
            info!("Call {} <-> {} ended: {}", session.caller_id, session.callee_id, reason);
            broadcast::to_user(
                &self.registry,
                session.counterpart(user_id),
                &ServerMessage::CallEnded {
                    ended_by: user_id.clone(),
                    reason: reason.to_string(),
                },
            );
        }
    }
}
