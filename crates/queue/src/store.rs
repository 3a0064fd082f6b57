//! Durable key/value rows for queue state
//!
//! The queue only needs `get`, `put` and `delete_where` over named tables.
//! `SledStore` keeps one sled tree per table; `MemoryStore` is for tests and
//! throwaway sessions.

use crate::error::StoreError;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use sled::Db;
use std::path::Path;

/// Table/key/value persistence
pub trait Store: Send + Sync {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    fn delete_where(&self, table: &str, key: &str) -> Result<(), StoreError>;

    /// Make previous writes durable
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read a JSON row
pub fn get_json<T: DeserializeOwned>(
    store: &dyn Store,
    table: &str,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(table, key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Write a JSON row
pub fn put_json<T: Serialize>(
    store: &dyn Store,
    table: &str,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.put(table, key, serde_json::to_vec(value)?)
}

/// sled-backed store
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(&path)?;
        tracing::info!("Opened store at {:?}", path.as_ref());
        Ok(Self { db })
    }
}

impl Store for SledStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.db.open_tree(table)?;
        Ok(tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let tree = self.db.open_tree(table)?;
        tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn delete_where(&self, table: &str, key: &str) -> Result<(), StoreError> {
        let tree = self.db.open_tree(table)?;
        tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<(String, String), Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .rows
            .get(&(table.to_string(), key.to_string()))
            .map(|r| r.value().clone()))
    }

    fn put(&self, table: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.rows.insert((table.to_string(), key.to_string()), value);
        Ok(())
    }

    fn delete_where(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.rows.remove(&(table.to_string(), key.to_string()));
        Ok(())
    }
}
