//! tally-core - Core library for Tally
//!
//! This crate contains the offline-first sync engine shared by all Tally
//! interfaces: the local mutation log and snapshot cache, the sync manager
//! that drains them against a server, and the wire protocol both sides speak.

pub mod db;
pub mod error;
pub mod models;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ClientId, EntityRecord, MutationWrite, Operation, QueueEntry, SyncStatusCounts};
pub use sync::{
    HttpSyncTransport, NetworkWatch, SyncError, SyncManager, SyncOptions, SyncReport,
    SyncTransport,
};
