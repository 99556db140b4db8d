//! pulsefeed-broadcast: Push delivery of event envelopes to dashboard clients
//!
//! The hub owns every live websocket connection and fans each envelope out
//! best-effort: a client that cannot keep up or whose socket fails is dropped,
//! the rest of the fan-out continues.

pub mod envelope;
pub mod hub;

pub use envelope::{
    ConnectionHealth, DatabaseInfo, EventData, EventInfo, EXPECTED_FRONTEND_VERSION, VERSION,
};
pub use hub::{BroadcastHub, EventSink};
