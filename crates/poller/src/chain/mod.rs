//! Block-explorer source: three window queries (blocks, confirmed
//! transactions, licensed contributors) with validator geo annotation.

pub mod collector;
pub mod database;

pub use collector::ChainCollector;
pub use database::{
    BlockRecord, ChainDatabase, ChainQueries, ContributorRecord, TransactionRecord,
};
