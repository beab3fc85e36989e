use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::RoomName;

/// A persisted chat message. Immutable once created: the store assigns
/// `id` and `timestamp` at append time and neither changes afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String, // nanoid(12)
    pub sender: String,
    pub content: String,
    pub room: RoomName,
    pub timestamp: DateTime<Utc>,
}

/// A message as accepted from a client, before the store has assigned an
/// id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: String,
    pub content: String,
    pub room: RoomName,
}

impl From<SendRequest> for NewMessage {
    fn from(req: SendRequest) -> Self {
        Self {
            sender: req.sender,
            content: req.content,
            room: RoomName::from_string(req.room),
        }
    }
}

/// Raw send request from a client channel. All fields required and
/// non-empty; validated by the fan-out coordinator before anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub sender: String,
    pub content: String,
    pub room: String,
}

impl SendRequest {
    /// Validate request shape. Rejection carries the first offending field.
    pub fn validate(&self) -> crate::Result<()> {
        for (field, value) in [
            ("sender", &self.sender),
            ("content", &self.content),
            ("room", &self.room),
        ] {
            if value.trim().is_empty() {
                return Err(crate::Error::InvalidRequest(format!(
                    "missing required field: {field}"
                )));
            }
        }
        Ok(())
    }
}
