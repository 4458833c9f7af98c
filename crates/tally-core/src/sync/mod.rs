//! Offline-first sync engine.
//!
//! Writes land in the local mutation log and snapshot cache synchronously, so
//! the app never blocks on the network. A [`SyncManager`] later drains the log
//! to the server in client order, pulls back changes other devices made, and
//! publishes status over watch channels. Reads go through [`merge_entities`],
//! which overlays still-pending offline rows on the server snapshot.

mod dedup;
mod manager;
mod merge;
mod net;
pub mod protocol;
mod transport;

pub use dedup::{fingerprint, local_duplicate_flags};
pub use manager::{EntryOutcome, SyncManager, SyncOptions, SyncReport};
pub use merge::{merge_entities, MergedEntity};
pub use net::NetworkWatch;
pub use transport::{HttpSyncTransport, SyncTransport, USER_HEADER};

use thiserror::Error;

/// Errors surfaced by the sync engine.
///
/// A server-detected duplicate is not an error: the mutation already landed,
/// so the engine resolves it like a success.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport or manager configuration is unusable
    #[error("Invalid sync configuration: {0}")]
    Config(String),
    /// Transient transport failure, including timeouts; safe to retry
    #[error("Network error: {0}")]
    Network(String),
    /// The server rejected the request; resending the same bytes cannot succeed
    #[error("Rejected by server: {0}")]
    Validation(String),
    /// The server answered with something the engine could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// An entry used up its retry budget and stays parked as failed
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    /// Local persistence failed
    #[error(transparent)]
    Store(#[from] crate::error::Error),
    /// Engine-internal failure, such as a panicked worker task
    #[error("Sync engine error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether retrying the same request later could succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Protocol(_))
    }
}

/// Convenience alias for sync engine results
pub type SyncResult<T> = Result<T, SyncError>;
