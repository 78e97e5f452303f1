//! Streaming core: the session table, the per-session generation driver and
//! the reconnection coordinator.

mod driver;
mod reconnect;
mod session_table;


pub(crate) use driver::{DriverContext, GenerationJob, drive_generation};
pub use reconnect::{ConversationView, ReconnectionCoordinator};
pub use session_table::{NewSession, SessionPhase, SessionSnapshot, SessionTable};
