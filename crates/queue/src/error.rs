//! Queue and store errors

use thiserror::Error;
use uuid::Uuid;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored row could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Transaction queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid password")]
    InvalidPassword,

    #[error("transaction {uuid} was rejected: {message}")]
    TransactionRejected { uuid: Uuid, message: String },

    #[error("consensus rolled back; account nonce must be reconciled first")]
    ConsensusRollback,

    #[error("peers do not agree on the account nonce")]
    NonceDivergence,

    #[error("no such transaction: {0}")]
    UnknownTransaction(Uuid),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<argon2::Error> for QueueError {
    fn from(error: argon2::Error) -> Self {
        QueueError::Signing(format!("key derivation failed: {}", error))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
