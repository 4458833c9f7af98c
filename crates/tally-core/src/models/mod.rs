//! Data models for Tally's sync layer

mod entity;
mod mutation;

pub use entity::{ClientId, EntityRecord};
pub use mutation::{EntryState, MutationWrite, Operation, QueueEntry, SyncStatusCounts};
