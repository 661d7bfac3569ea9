pub mod handler;
pub mod liveness;
pub mod session;

pub use handler::{router, RelayState};
pub use session::{ClientSession, SessionId};
