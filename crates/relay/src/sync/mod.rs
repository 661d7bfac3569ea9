pub mod broadcast;
pub mod persist;
pub mod reaper;
pub mod registry;
pub mod room;

/// An opaque update payload. Never inspected, only stored and relayed.
pub type Fragment = axum::body::Bytes;

pub use broadcast::{Broadcaster, IngestOutcome};
pub use persist::HistoryWriter;
pub use registry::RoomRegistry;
pub use room::{Room, RoomStats};
