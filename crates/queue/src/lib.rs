//! Light client transaction broadcast queue
//!
//! Architecture:
//! - Wallet transactions are staged, then signed as a batch with contiguous
//!   nonces using a password-sealed ed25519 key
//! - Each tick sends or polls the lowest-nonce active transaction at every
//!   peer the consensus tracker currently trusts
//! - Finality comes from the account nonce; unanimous rejection blocks the
//!   rest of the queue until the caller clears it
//! - After a consensus rollback the account nonce is reconciled and any
//!   transactions accepted past it are marked lost
//! - Queue, history and account state are persisted through a `Store`

pub mod account;
pub mod error;
pub mod keystore;
pub mod queue;
pub mod store;
pub mod types;

pub use account::{AccountState, AccountView, LocalAccount, TransactionError};
pub use error::{QueueError, Result, StoreError};
pub use keystore::{Ed25519Signer, KeyStore, PasswordKeyStore, SigningKey};
pub use queue::{QueueContext, TransactionQueue};
pub use store::{get_json, put_json, MemoryStore, SledStore, Store};
pub use types::{
    NonceLookup, ProcessOutcome, QueueConfig, QueueEvent, QueueStats, DEFAULT_NONCE_ROUNDS,
};
