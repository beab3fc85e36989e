use serde::{Deserialize, Serialize};

use chatrelay_core::models::{Message, RoomName};

/// Events delivered to client connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One-time history snapshot sent on room join, oldest-first.
    RoomHistory { messages: Vec<Message> },

    /// A chat message fanned out to room members.
    ReceiveMessage { message: Message },

    /// Another member started typing. Ephemeral, never persisted.
    UserTyping { user: String, room: RoomName },

    /// Another member stopped typing.
    UserStopTyping { user: String, room: RoomName },

    /// Failure report to the originating connection only.
    Error { message: String },
}

impl ServerEvent {
    /// Short description of the event type (for logging)
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::RoomHistory { .. } => "room_history",
            Self::ReceiveMessage { .. } => "receive_message",
            Self::UserTyping { .. } => "user_typing",
            Self::UserStopTyping { .. } => "user_stop_typing",
            Self::Error { .. } => "error",
        }
    }

    /// Room the event belongs to, where one applies.
    #[must_use]
    pub fn room(&self) -> Option<&RoomName> {
        match self {
            Self::ReceiveMessage { message } => Some(&message.room),
            Self::UserTyping { room, .. } | Self::UserStopTyping { room, .. } => Some(room),
            Self::RoomHistory { .. } | Self::Error { .. } => None,
        }
    }
}

/// Commands received from client connections. Disconnect is signaled by
/// the channel closing, not by a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    JoinRoom {
        room: String,
    },
    SendMessage {
        sender: String,
        content: String,
        room: String,
    },
    Typing {
        sender: String,
        room: String,
    },
    StopTyping {
        sender: String,
        room: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_server_event_serialization() {
        let event = ServerEvent::ReceiveMessage {
            message: Message {
                id: "abc123def456".to_string(),
                sender: "alice".to_string(),
                content: "Hello world!".to_string(),
                room: RoomName::from("general"),
                timestamp: Utc::now(),
            },
        };

        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("receive_message"));
        assert!(json.contains("Hello world!"));

        let deserialized: ServerEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(deserialized.event_type(), "receive_message");
        assert_eq!(deserialized.room().map(RoomName::as_str), Some("general"));
    }

    #[test]
    fn test_typing_event_carries_room() {
        let event = ServerEvent::UserTyping {
            user: "bob".to_string(),
            room: RoomName::from("general"),
        };
        assert_eq!(event.event_type(), "user_typing");
        assert_eq!(event.room().map(RoomName::as_str), Some("general"));
    }

    #[test]
    fn test_client_command_deserialization() {
        let json = r#"{"type":"send_message","sender":"alice","content":"hi","room":"general"}"#;
        let cmd: ClientCommand = serde_json::from_str(json).expect("deserialize");
        assert!(matches!(
            cmd,
            ClientCommand::SendMessage { ref sender, .. } if sender == "alice"
        ));

        let json = r#"{"type":"join_room","room":"general"}"#;
        let cmd: ClientCommand = serde_json::from_str(json).expect("deserialize");
        assert!(matches!(cmd, ClientCommand::JoinRoom { ref room } if room == "general"));
    }
}
