pub mod id;
pub mod message;

pub use id::{generate_id, ConnectionId, RoomName};
pub use message::{Message, NewMessage, SendRequest};
