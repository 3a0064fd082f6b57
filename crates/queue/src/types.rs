//! Configuration, events and outcomes for the transaction queue

use light_types::{TxStatus, RECORD_BY_HOURS};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Default rounds of nonce polling before giving up
pub const DEFAULT_NONCE_ROUNDS: usize = 4;

/// Configuration for a transaction queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub account_id: String,
    /// Name of the signing key written into every body
    pub key_name: String,
    /// Password-sealed signing key
    pub sealed_key: Vec<u8>,
    /// How long after signing a transaction may still be recorded
    pub record_window: chrono::Duration,
    pub nonce_rounds: usize,
    /// Pause between inconclusive nonce rounds
    pub nonce_retry_delay: Duration,
}

impl QueueConfig {
    pub fn new(account_id: impl Into<String>, key_name: impl Into<String>, sealed_key: Vec<u8>) -> Self {
        Self {
            account_id: account_id.into(),
            key_name: key_name.into(),
            sealed_key,
            record_window: chrono::Duration::hours(RECORD_BY_HOURS),
            nonce_rounds: DEFAULT_NONCE_ROUNDS,
            nonce_retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_nonce_rounds(mut self, rounds: usize) -> Self {
        self.nonce_rounds = rounds.max(1);
        self
    }

    pub fn with_nonce_retry_delay(mut self, delay: Duration) -> Self {
        self.nonce_retry_delay = delay;
        self
    }

    pub fn with_record_window(mut self, window: chrono::Duration) -> Self {
        self.record_window = window;
        self
    }
}

/// Change notifications published by the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum QueueEvent {
    StatusChanged { uuid: Uuid, status: TxStatus },
    Blocked { uuid: Uuid, message: String },
    Restored { count: usize },
    NonceDivergence,
}

/// What one processing tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another tick is still running
    Busy,
    /// Peers disagree on the nonce after a rollback
    Paused,
    /// A rollback is pending and no peer agrees with consensus yet
    AwaitingPeers,
    /// A rejected transaction must be cleared first
    Blocked,
    /// Nothing active to send
    Idle,
    /// The head transaction was sent or polled
    Processed { uuid: Uuid, status: TxStatus },
}

/// Answer to asking every current peer for the account nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceLookup {
    Agreed(u64),
    /// Peers answered but no round was unanimous
    Disagreed,
    /// Nobody to ask
    NoPeers,
}

impl NonceLookup {
    pub fn nonce(self) -> Option<u64> {
        match self {
            NonceLookup::Agreed(nonce) => Some(nonce),
            NonceLookup::Disagreed | NonceLookup::NoPeers => None,
        }
    }
}

/// Count of queued transactions by status
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub staged: usize,
    pub active: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub blocked: usize,
    pub lost: usize,
    pub restored: usize,
    pub history: usize,
    pub nonce_divergence: bool,
}
