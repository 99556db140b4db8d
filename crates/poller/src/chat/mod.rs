//! Chat platform source: one window query over new messages, plus an
//! on-demand per-user address lookup for duplicate-domain disambiguation.

pub mod collector;
pub mod database;

pub use collector::ChatCollector;
pub use database::{ChatDatabase, ChatMessage, ChatQueries};
