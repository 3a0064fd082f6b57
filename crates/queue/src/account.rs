//! Local view of the wallet account
//!
//! The queue reads the locally known nonce to detect finality, writes back
//! the nonce peers agree on, and folds the side effects of final
//! transactions into the account's asset sets.

use crate::error::StoreError;
use crate::store::{get_json, put_json, Store};
use light_types::SideEffects;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

const ACCOUNT_TABLE: &str = "account";

/// The rejection that blocks an account until it is cleared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionError {
    pub uuid: Uuid,
    pub message: String,
}

/// What the queue needs to know about, and may change on, the account
pub trait AccountView: Send + Sync {
    /// Next nonce the network expects, if known
    fn nonce(&self) -> Option<u64>;

    fn set_nonce(&self, nonce: u64) -> Result<(), StoreError>;

    fn merge_side_effects(&self, effects: &SideEffects) -> Result<(), StoreError>;

    fn transaction_error(&self) -> Option<TransactionError>;

    /// Must be durable before returning; a lost error would unblock the queue
    fn set_transaction_error(&self, error: Option<TransactionError>) -> Result<(), StoreError>;
}

/// Persisted account fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    pub nonce: Option<u64>,
    pub reserved: BTreeSet<String>,
    pub consumed: BTreeSet<String>,
    pub transaction_error: Option<TransactionError>,
}

/// Account view kept in memory and written through to a store
pub struct LocalAccount {
    account_id: String,
    state: RwLock<AccountState>,
    store: Option<Arc<dyn Store>>,
}

impl LocalAccount {
    /// Account with no backing store
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            state: RwLock::new(AccountState::default()),
            store: None,
        }
    }

    /// Load the account from `store`, or start empty if it has no row
    pub fn load(account_id: impl Into<String>, store: Arc<dyn Store>) -> Result<Self, StoreError> {
        let account_id = account_id.into();
        let state: AccountState =
            get_json(store.as_ref(), ACCOUNT_TABLE, &account_id)?.unwrap_or_default();
        Ok(Self {
            account_id,
            state: RwLock::new(state),
            store: Some(store),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn state(&self) -> AccountState {
        self.state.read().clone()
    }

    pub fn is_reserved(&self, asset_id: &str) -> bool {
        self.state.read().reserved.contains(asset_id)
    }

    /// Apply `change` and write the row; memory is left untouched if the write fails
    fn update(&self, change: impl FnOnce(&mut AccountState)) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let mut next = state.clone();
        change(&mut next);
        if let Some(store) = &self.store {
            put_json(store.as_ref(), ACCOUNT_TABLE, &self.account_id, &next)?;
        }
        *state = next;
        Ok(())
    }
}

impl AccountView for LocalAccount {
    fn nonce(&self) -> Option<u64> {
        self.state.read().nonce
    }

    fn set_nonce(&self, nonce: u64) -> Result<(), StoreError> {
        if self.nonce() == Some(nonce) {
            return Ok(());
        }
        self.update(|s| s.nonce = Some(nonce))
    }

    fn merge_side_effects(&self, effects: &SideEffects) -> Result<(), StoreError> {
        if effects.is_empty() {
            return Ok(());
        }
        self.update(|s| {
            s.reserved.extend(effects.reserved.iter().cloned());
            for id in &effects.consumed {
                s.reserved.remove(id);
                s.consumed.insert(id.clone());
            }
        })
    }

    fn transaction_error(&self) -> Option<TransactionError> {
        self.state.read().transaction_error.clone()
    }

    fn set_transaction_error(&self, error: Option<TransactionError>) -> Result<(), StoreError> {
        self.update(|s| s.transaction_error = error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_side_effects_move_reserved_to_consumed() {
        let account = LocalAccount::new("acct-1");
        account
            .merge_side_effects(&SideEffects {
                reserved: vec!["a".into(), "b".into()],
                consumed: vec![],
            })
            .unwrap();
        assert!(account.is_reserved("a"));

        account
            .merge_side_effects(&SideEffects {
                reserved: vec![],
                consumed: vec!["a".into()],
            })
            .unwrap();
        let state = account.state();
        assert!(!state.reserved.contains("a"));
        assert!(state.reserved.contains("b"));
        assert!(state.consumed.contains("a"));
    }

    #[test]
    fn test_account_writes_through_to_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        {
            let account = LocalAccount::load("acct-1", store.clone()).unwrap();
            account.set_nonce(9).unwrap();
            account
                .set_transaction_error(Some(TransactionError {
                    uuid: Uuid::nil(),
                    message: "insufficient funds".into(),
                }))
                .unwrap();
        }

        let reloaded = LocalAccount::load("acct-1", store).unwrap();
        assert_eq!(reloaded.nonce(), Some(9));
        assert_eq!(
            reloaded.transaction_error().map(|e| e.message),
            Some("insufficient funds".to_string())
        );
        assert_eq!(reloaded.account_id(), "acct-1");
    }

    /// Store whose writes always fail
    struct ReadOnlyStore(MemoryStore);

    impl Store for ReadOnlyStore {
        fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.0.get(table, key)
        }

        fn put(&self, _table: &str, _key: &str, _value: Vec<u8>) -> Result<(), StoreError> {
            Err(StoreError::Backend("read-only".into()))
        }

        fn delete_where(&self, table: &str, key: &str) -> Result<(), StoreError> {
            self.0.delete_where(table, key)
        }
    }

    #[test]
    fn test_failed_write_is_reported_and_not_applied() {
        let store: Arc<dyn Store> = Arc::new(ReadOnlyStore(MemoryStore::new()));
        let account = LocalAccount::load("acct-1", store).unwrap();

        let error = TransactionError {
            uuid: Uuid::nil(),
            message: "bad nonce".into(),
        };
        assert!(matches!(
            account.set_transaction_error(Some(error)),
            Err(StoreError::Backend(_))
        ));
        assert!(account.transaction_error().is_none());
        assert!(account.set_nonce(3).is_err());
        assert_eq!(account.nonce(), None);
    }

    #[test]
    fn test_unreadable_row_fails_the_load() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.put(ACCOUNT_TABLE, "acct-1", b"not json".to_vec()).unwrap();
        assert!(matches!(
            LocalAccount::load("acct-1", store),
            Err(StoreError::Codec(_))
        ));
    }
}
