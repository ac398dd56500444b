//! Storage trait and the in-memory implementation.
//!
//! A storage is a set of named tables, each a flat `key -> JSON value` map.
//! Everything above this layer (typed tables, LRU rotation, account logs) is
//! expressed in terms of these six operations.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Trait for persistent key/value storage organized in named tables.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Get a value, `None` if the key is absent.
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;

    /// Insert or overwrite a value.
    async fn set(&self, table: &str, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    async fn remove(&self, table: &str, key: &str) -> Result<()>;

    /// Remove every key of a table.
    async fn clear(&self, table: &str) -> Result<()>;

    /// All keys of a table.
    async fn keys(&self, table: &str) -> Result<Vec<String>>;

    /// Number of keys in a table.
    async fn len(&self, table: &str) -> Result<usize>;

    /// Check if a table is empty.
    async fn is_empty(&self, table: &str) -> Result<bool> {
        Ok(self.len(table).await? == 0)
    }
}

/// In-memory implementation of [`Storage`].
///
/// Lives as long as the process. Sharing one instance behind an `Arc` between
/// successive registries is how tests observe "restart" behavior.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Names of the tables holding at least one key.
    pub fn table_names(&self) -> Vec<String> {
        let tables = self.tables.read();
        let mut names: Vec<_> = tables
            .iter()
            .filter(|(_, table)| !table.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn set(&self, table: &str, key: &str, value: Value) -> Result<()> {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, table: &str, key: &str) -> Result<()> {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.tables.write().remove(table);
        Ok(())
    }

    async fn keys(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, table: &str) -> Result<usize> {
        Ok(self.tables.read().get(table).map(|t| t.len()).unwrap_or(0))
    }
}
