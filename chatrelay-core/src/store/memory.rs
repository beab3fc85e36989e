use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeSet;

use super::MessageStore;
use crate::models::{generate_id, Message, NewMessage, RoomName};
use crate::{Error, Result};

/// In-memory message store.
///
/// Used by tests and by single-instance development mode when no database
/// is configured. The `fail_appends` and `fail_reads` toggles turn the
/// corresponding operations into `StoreUnavailable`/`HistoryUnavailable`,
/// which is how tests exercise failure paths without a real outage.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<Message>>,
    fail_appends: RwLock<bool>,
    fail_reads: RwLock<bool>,
}

impl MemoryMessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail with `StoreUnavailable`.
    pub fn set_fail_appends(&self, fail: bool) {
        *self.fail_appends.write() = fail;
    }

    /// Make subsequent history reads fail with `HistoryUnavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.write() = fail;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message> {
        if *self.fail_appends.read() {
            return Err(Error::StoreUnavailable(
                "memory store configured to reject writes".to_string(),
            ));
        }

        let message = Message {
            id: generate_id(),
            sender: message.sender,
            content: message.content,
            room: message.room,
            timestamp: Utc::now(),
        };
        self.messages.write().push(message.clone());
        Ok(message)
    }

    async fn recent(&self, room: &RoomName, limit: usize) -> Result<Vec<Message>> {
        if *self.fail_reads.read() {
            return Err(Error::HistoryUnavailable(
                "memory store configured to reject reads".to_string(),
            ));
        }

        let messages = self.messages.read();
        let mut matching: Vec<Message> = messages
            .iter()
            .filter(|m| &m.room == room)
            .cloned()
            .collect();
        // Appends keep insertion order, which is timestamp order per store.
        if matching.len() > limit {
            matching.drain(..matching.len() - limit);
        }
        Ok(matching)
    }

    async fn room_names(&self) -> Result<Vec<String>> {
        let rooms: BTreeSet<String> = self
            .messages
            .read()
            .iter()
            .map(|m| m.room.as_str().to_string())
            .collect();
        Ok(rooms.into_iter().collect())
    }
}
