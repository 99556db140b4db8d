//! pulsefeed-poller: Per-source polling state machines
//!
//! Every data source gets one poller: a ticking loop that queries the
//! backend for the last window of activity, enriches the records with
//! organization names and coordinates, and hands the resulting envelope to
//! the broadcast hub. Backend outages are recovered by a flat-interval
//! reconnector; a tick with no connected dashboard clients skips the backend
//! entirely.

pub mod chain;
pub mod chat;
pub mod enrich;
pub mod error;
pub mod filesync;
pub mod poller;
pub mod postgres;
pub mod reconnect;
pub mod traits;

pub use error::BackendError;
pub use poller::Poller;
pub use reconnect::Reconnector;
pub use traits::{BackendConnection, Collector, Harvest};
