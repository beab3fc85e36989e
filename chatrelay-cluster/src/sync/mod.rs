// Module: sync

pub mod bus;
pub mod dedup;
pub mod events;
pub mod fanout;
pub mod registry;

pub use bus::{BroadcastBus, LoopbackBus, MessageHandler, RedisBus};
pub use dedup::MessageDeduplicator;
pub use events::{ClientCommand, ServerEvent};
pub use fanout::FanoutCoordinator;
pub use registry::{ClientSender, RoomRegistry};
