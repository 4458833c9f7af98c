//! tally-api - Sync server for Tally
//!
//! Serves the push/pull/duplicate-check endpoints over the authoritative
//! sync ledger. The binary in `main.rs` wires this together; the library
//! form exists so integration tests can run the router in-process.

pub mod auth;
pub mod config;
pub mod error;
pub mod ledger;
pub mod rate_limit;
pub mod routes;
