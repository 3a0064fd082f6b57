//! Shared types for the light ledger client
//!
//! This crate holds the value types that both the peer consensus tracker and
//! the transaction broadcast queue exchange, plus the JSON shapes peers speak
//! on the wire.

pub mod chain;
pub mod transaction;
pub mod wire;

pub use chain::{Digest, PeerId};
pub use transaction::{
    Envelope, HistoryEntry, SideEffects, Transaction, TransactionBody, TransactionKind, TxStatus,
};

/// How many peer URLs a probe asks each peer to sample from its own list
pub const DEFAULT_PEER_SAMPLE: usize = 16;

/// Window of the latency moving average, in samples
pub const LATENCY_WINDOW: u32 = 10;

/// A signed transaction must be recorded within this many hours
pub const RECORD_BY_HOURS: i64 = 8;
