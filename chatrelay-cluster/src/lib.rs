pub mod sync;

pub use sync::{
    BroadcastBus, ClientCommand, FanoutCoordinator, LoopbackBus, MessageDeduplicator, RedisBus,
    RoomRegistry, ServerEvent,
};
