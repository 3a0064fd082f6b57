//! Wallet transactions and their lifecycle

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// What a transaction does, with the payload that kind carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransactionKind {
    /// Move funds to another account
    Transfer { recipient: String, amount: u64 },
    /// Reserve assets for later use
    #[serde(rename_all = "camelCase")]
    ReserveAssets { asset_ids: Vec<String> },
    /// Spend previously reserved assets
    #[serde(rename_all = "camelCase")]
    ConsumeAssets { asset_ids: Vec<String> },
    /// Anything this client carries without interpreting
    Custom { payload: serde_json::Value },
}

/// Asset bookkeeping a transaction applies to the account once it is final
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideEffects {
    pub reserved: Vec<String>,
    pub consumed: Vec<String>,
}

impl SideEffects {
    pub fn of(kind: &TransactionKind) -> Self {
        match kind {
            TransactionKind::ReserveAssets { asset_ids } => Self {
                reserved: asset_ids.clone(),
                consumed: Vec::new(),
            },
            TransactionKind::ConsumeAssets { asset_ids } => Self {
                reserved: Vec::new(),
                consumed: asset_ids.clone(),
            },
            TransactionKind::Transfer { .. } | TransactionKind::Custom { .. } => Self::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty() && self.consumed.is_empty()
    }
}

/// The signed part of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBody {
    /// Account that pays for and orders this transaction
    pub maker: String,
    /// Name of the key the maker signs with
    pub key_name: String,
    /// Assigned at submission
    pub nonce: Option<u64>,
    pub gratuity: u64,
    /// Deadline for inclusion, assigned at submission
    pub record_by: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: TransactionKind,
}

impl TransactionBody {
    pub fn new(maker: impl Into<String>, key_name: impl Into<String>, kind: TransactionKind) -> Self {
        Self {
            maker: maker.into(),
            key_name: key_name.into(),
            nonce: None,
            gratuity: 0,
            record_by: None,
            kind,
        }
    }

    pub fn with_gratuity(mut self, gratuity: u64) -> Self {
        self.gratuity = gratuity;
        self
    }
}

/// Serialized body plus signature, ready to PUT to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub body: String,
    pub signature: String,
    pub public_key: String,
}

/// Lifecycle of a queued transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Staged,
    Pending,
    Sent,
    Accepted,
    Rejected,
    Mixed,
    Blocked,
    Lost,
    Restored,
}

impl TxStatus {
    /// Signed and still waiting on the network
    pub fn is_active(self) -> bool {
        matches!(self, TxStatus::Pending | TxStatus::Sent | TxStatus::Mixed)
    }

    /// Settled one way or the other; the queue no longer drives it
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            TxStatus::Staged | TxStatus::Pending | TxStatus::Sent | TxStatus::Mixed
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::Staged => "STAGED",
            TxStatus::Pending => "PENDING",
            TxStatus::Sent => "SENT",
            TxStatus::Accepted => "ACCEPTED",
            TxStatus::Rejected => "REJECTED",
            TxStatus::Mixed => "MIXED",
            TxStatus::Blocked => "BLOCKED",
            TxStatus::Lost => "LOST",
            TxStatus::Restored => "RESTORED",
        };
        f.write_str(name)
    }
}

/// One wallet-originated ledger operation and its local bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub uuid: Uuid,
    pub body: TransactionBody,
    pub side_effects: SideEffects,
    pub envelope: Option<Envelope>,
    pub status: TxStatus,
    /// Peer URLs this transaction has been PUT to
    #[serde(default)]
    pub targeted_peers: BTreeSet<String>,
    #[serde(default)]
    pub accepted_count: u32,
    /// Last message a peer attached to a rejection
    #[serde(default)]
    pub message: Option<String>,
}

impl Transaction {
    /// Create a staged transaction
    pub fn new(body: TransactionBody) -> Self {
        Self::with_uuid(Uuid::new_v4(), body)
    }

    pub fn with_uuid(uuid: Uuid, body: TransactionBody) -> Self {
        let side_effects = SideEffects::of(&body.kind);
        Self {
            uuid,
            body,
            side_effects,
            envelope: None,
            status: TxStatus::Staged,
            targeted_peers: BTreeSet::new(),
            accepted_count: 0,
            message: None,
        }
    }

    /// Rebuild a transaction the peer log says was recorded
    pub fn restored(entry: &HistoryEntry) -> Self {
        let mut body = entry.body.clone();
        body.nonce = Some(entry.nonce);
        let mut tx = Self::with_uuid(entry.uuid, body);
        tx.status = TxStatus::Restored;
        tx
    }

    pub fn nonce(&self) -> Option<u64> {
        self.body.nonce
    }

    /// Stamp nonce and deadline ahead of signing
    pub fn prepare(&mut self, nonce: u64, now: DateTime<Utc>, record_window: Duration) {
        self.body.nonce = Some(nonce);
        self.body.record_by = Some(now + record_window);
    }

    /// Forget which peers were targeted and what they said
    pub fn clear_peer_bookkeeping(&mut self) {
        self.targeted_peers.clear();
        self.accepted_count = 0;
    }
}

/// A confirmed transaction as recorded in a peer's account log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub uuid: Uuid,
    pub nonce: u64,
    pub body: TransactionBody,
}
