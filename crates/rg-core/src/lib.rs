//! RG Core - keyring trust, caches and message flows for RG messaging.
//!
//! This crate implements:
//! - Persistent keyring with trust and signature states
//! - Read-optimized keyring cache with background refresh
//! - Replay detection per account and scope
//! - Dialog scope derivation and matching
//! - Text, file and stream transport codecs
//! - Encrypt and decrypt flows with status mapping

#![forbid(unsafe_code)]

// Keyring
pub mod store;
pub mod keyring;
pub mod keyring_cache;
pub mod keystore;

// Message flows
pub mod scope;
pub mod codec;
pub mod messages;
pub mod decrypt;
pub mod replay_cache;

// Supporting modules
pub mod config;
pub mod errors;

// Optional storage implementations
#[cfg(feature = "sqlite")]
pub mod sqlite_store;

#[cfg(test)]
mod proptests;

/// Wall clock in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
