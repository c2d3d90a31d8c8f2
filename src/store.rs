//! External message store
//!
//! The relay never owns durable state. Chat history, edits and deletions
//! go through a [`MessageStore`], and display names for users that announce
//! themselves without one are resolved through it as well.
//!
//! [`MemoryStore`] is the in-process implementation used by the binary
//! and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{MessageId, RoomId, UserId};

/// Kind of chat message content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

/// Optional file metadata carried by image/file messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

/// A message about to be persisted
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Attachment,
}

/// A persisted message, as returned by the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(flatten)]
    pub attachment: Attachment,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Durable storage collaborator
///
/// Mutations are authorized against the persisted row: `mark_edited` and
/// `mark_deleted` return [`StoreError::Forbidden`] when `user_id` is not the
/// author, and [`StoreError::NotFound`] when the row is missing or deleted.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a chat message, assigning its id and creation time
    ///
    /// Ids increase with insertion order.
    async fn insert(&self, message: NewMessage) -> Result<StoredMessage, StoreError>;

    /// Replace the content of a message, returning the edit time
    async fn mark_edited(
        &self,
        message_id: MessageId,
        user_id: &UserId,
        content: &str,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Soft-delete a message
    async fn mark_deleted(&self, message_id: MessageId, user_id: &UserId)
        -> Result<(), StoreError>;

    /// The newest `limit` live messages of a room, oldest first
    async fn recent_by_room(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Display name of a registered user, if known
    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, StoreError>;
}

#[derive(Debug)]
struct Row {
    message: StoredMessage,
    deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: MessageId,
    rows: Vec<Row>,
    users: HashMap<UserId, String>,
}

/// In-memory [`MessageStore`]
///
/// `set_unavailable(true)` makes every call fail with
/// [`StoreError::Unavailable`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a display name for the identity lookup
    pub fn register_user(&self, user_id: UserId, username: impl Into<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.users.insert(user_id, username.into());
        }
    }

    /// Simulate the backing database going away (or coming back)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

impl Inner {
    fn live_row_mut(&mut self, message_id: MessageId) -> Result<&mut Row, StoreError> {
        self.rows
            .iter_mut()
            .find(|row| row.message.id == message_id && row.deleted_at.is_none())
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, message: NewMessage) -> Result<StoredMessage, StoreError> {
        let mut inner = self.lock()?;
        inner.next_id += 1;

        let stored = StoredMessage {
            id: inner.next_id,
            room_id: message.room_id,
            user_id: message.user_id,
            content: message.content,
            kind: message.kind,
            attachment: message.attachment,
            created_at: Utc::now(),
            edited_at: None,
        };
        inner.rows.push(Row {
            message: stored.clone(),
            deleted_at: None,
        });
        Ok(stored)
    }

    async fn mark_edited(
        &self,
        message_id: MessageId,
        user_id: &UserId,
        content: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut inner = self.lock()?;
        let row = inner.live_row_mut(message_id)?;
        if &row.message.user_id != user_id {
            return Err(StoreError::Forbidden);
        }

        let edited_at = Utc::now();
        row.message.content = content.to_string();
        row.message.edited_at = Some(edited_at);
        Ok(edited_at)
    }

    async fn mark_deleted(
        &self,
        message_id: MessageId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let row = inner.live_row_mut(message_id)?;
        if &row.message.user_id != user_id {
            return Err(StoreError::Forbidden);
        }

        row.deleted_at = Some(Utc::now());
        Ok(())
    }

    async fn recent_by_room(
        &self,
        room_id: RoomId,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock()?;
        let mut messages: Vec<StoredMessage> = inner
            .rows
            .iter()
            .filter(|row| row.message.room_id == room_id && row.deleted_at.is_none())
            .map(|row| row.message.clone())
            .collect();

        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn display_name(&self, user_id: &UserId) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.users.get(user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(room: i64, user: &str, content: &str) -> NewMessage {
        NewMessage {
            room_id: RoomId(room),
            user_id: UserId::from(user),
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment: Attachment::default(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let a = store.insert(text(1, "alice", "one")).await.unwrap();
        let b = store.insert(text(1, "bob", "two")).await.unwrap();

        assert!(b.id > a.id);
        assert!(b.created_at >= a.created_at);
    }

    #[tokio::test]
    async fn test_edit_checks_author() {
        let store = MemoryStore::new();
        let msg = store.insert(text(1, "alice", "hello")).await.unwrap();

        let err = store
            .mark_edited(msg.id, &UserId::from("bob"), "hijacked")
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Forbidden);

        store
            .mark_edited(msg.id, &UserId::from("alice"), "hello!")
            .await
            .unwrap();
        let history = store.recent_by_room(RoomId(1), 10).await.unwrap();
        assert_eq!(history[0].content, "hello!");
        assert!(history[0].edited_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_and_deleted_rows_are_not_found() {
        let store = MemoryStore::new();
        let alice = UserId::from("alice");
        assert_eq!(
            store.mark_deleted(99, &alice).await.unwrap_err(),
            StoreError::NotFound
        );

        let msg = store.insert(text(1, "alice", "bye")).await.unwrap();
        store.mark_deleted(msg.id, &alice).await.unwrap();
        assert_eq!(
            store.mark_edited(msg.id, &alice, "again").await.unwrap_err(),
            StoreError::NotFound
        );
        assert!(store.recent_by_room(RoomId(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_by_room_keeps_newest_in_order() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert(text(7, "alice", &format!("m{i}"))).await.unwrap();
        }
        store.insert(text(8, "alice", "other room")).await.unwrap();

        let recent = store.recent_by_room(RoomId(7), 3).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.insert(text(1, "alice", "lost")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_unavailable(false);
        assert!(store.insert(text(1, "alice", "kept")).await.is_ok());
    }

    #[tokio::test]
    async fn test_display_name_lookup() {
        let store = MemoryStore::new();
        store.register_user(UserId::from("u1"), "Alice");

        assert_eq!(
            store.display_name(&UserId::from("u1")).await.unwrap(),
            Some("Alice".to_string())
        );
        assert_eq!(store.display_name(&UserId::from("u2")).await.unwrap(), None);
    }
}
