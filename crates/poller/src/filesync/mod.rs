//! File-sync platform source: three window queries (file changes, library
//! creations, activated users) with guest/inviter organization resolution.

pub mod collector;
pub mod database;

pub use collector::FileSyncCollector;
pub use database::{
    ActivatedUserRecord, FileChangeRecord, FileSyncDatabase, FileSyncQueries,
    LibraryCreationRecord,
};
