use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Row};

use super::MessageStore;
use crate::models::{generate_id, Message, NewMessage, RoomName};
use crate::{Error, Result};

/// Postgres-backed message store.
///
/// Schema:
/// ```sql
/// CREATE TABLE messages (
///     id         CHAR(12) PRIMARY KEY,
///     sender     TEXT NOT NULL,
///     content    TEXT NOT NULL,
///     room       TEXT NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL
/// );
/// CREATE INDEX messages_room_created_at_idx ON messages (room, created_at DESC);
/// ```
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_message(row: &PgRow) -> Result<Message> {
        Ok(Message {
            id: row.try_get("id")?,
            sender: row.try_get("sender")?,
            content: row.try_get("content")?,
            room: RoomName::from_string(row.try_get("room")?),
            timestamp: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message> {
        // Timestamp authority is local to the appending instance.
        let row = sqlx::query(
            r"
            INSERT INTO messages (id, sender, content, room, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, sender, content, room, created_at
            ",
        )
        .bind(generate_id())
        .bind(&message.sender)
        .bind(&message.content)
        .bind(message.room.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_message(&row)
    }

    async fn recent(&self, room: &RoomName, limit: usize) -> Result<Vec<Message>> {
        // Newest-first in SQL so LIMIT keeps the most recent, then reversed
        // to hand callers the oldest-first order histories are shown in.
        let rows = sqlx::query(
            r"
            SELECT id, sender, content, room, created_at
            FROM messages
            WHERE room = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(room.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::HistoryUnavailable(e.to_string()))?;

        let mut messages: Vec<Message> = rows
            .iter()
            .map(Self::row_to_message)
            .collect::<Result<_>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn room_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r"
            SELECT DISTINCT room FROM messages ORDER BY room
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("room").map_err(Into::into))
            .collect()
    }
}
