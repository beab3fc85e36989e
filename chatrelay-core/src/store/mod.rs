//! Message Store Gateway
//!
//! Durable storage is modeled as an append-only log with query-by-room
//! capability. The coordinator only ever holds the trait object, so tests
//! and single-node development substitute the in-memory implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::{Message, NewMessage, RoomName};
use crate::Result;

/// How many messages a room history snapshot carries.
pub const HISTORY_LIMIT: usize = 50;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message, assigning its id and timestamp. The returned
    /// `Message` is the durable record; fails with `StoreUnavailable`.
    async fn append(&self, message: NewMessage) -> Result<Message>;

    /// The `limit` most recent messages for a room, returned oldest-first.
    /// A room with no history yields an empty list, not an error.
    async fn recent(&self, room: &RoomName, limit: usize) -> Result<Vec<Message>>;

    /// Distinct room names with at least one persisted message.
    async fn room_names(&self) -> Result<Vec<String>>;
}

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;
