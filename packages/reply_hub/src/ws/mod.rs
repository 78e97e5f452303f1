//! WebSocket surface
//!
//! One socket per client. The registry tracks connections and project
//! rooms; the handler owns the socket halves and the bounded outbound queue;
//! the dispatcher turns decoded client envelopes into hub calls.

pub(crate) mod dispatch;
mod handler;
mod protocol;
mod registry;

pub use handler::handle_stream_ws;
pub use protocol::{Envelope, ServerMessage, SessionSummary};
pub use registry::{
    ConnectionId, ConnectionIdentity, ConnectionRegistry, Outbound, RoomKey, deliver_all,
};
