//! Local persistence layer for the sync engine

mod cache;
mod connection;
mod migrations;
mod queue;

pub use cache::{SnapshotCache, SqliteSnapshotCache};
pub use connection::LocalStore;
pub use queue::{MutationLog, SqliteMutationLog};
