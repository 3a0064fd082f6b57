//! Per-peer failures
//!
//! None of these are fatal to a tick: the tracker turns them into an
//! offline mark for the peer that produced them.

use light_types::Digest;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer {url} unreachable: {reason}")]
    NetworkUnreachable { url: String, reason: String },

    #[error("peer {url} timed out")]
    Timeout { url: String },

    #[error("peer {url} follows genesis {found}, expected {expected}")]
    GenesisMismatch {
        url: String,
        expected: Digest,
        found: Digest,
    },

    #[error("peer {url} sent a bad response: {reason}")]
    BadResponse { url: String, reason: String },

    #[error("not a usable peer url: {0}")]
    InvalidUrl(String),
}
