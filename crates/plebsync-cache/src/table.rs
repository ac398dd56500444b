//! Typed handle on one storage table.

use crate::error::Result;
use crate::storage::Storage;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A named table of a [`Storage`], converting values through serde.
#[derive(Clone)]
pub struct Table {
    storage: Arc<dyn Storage>,
    name: String,
}

impl Table {
    pub fn new(storage: Arc<dyn Storage>, name: impl Into<String>) -> Self {
        Self {
            storage,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.storage.get(&self.name, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.storage.set(&self.name, key, value).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.storage.get(&self.name, key).await?.is_some())
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        self.storage.remove(&self.name, key).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.clear(&self.name).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        self.storage.keys(&self.name).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.storage.len(&self.name).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.storage.is_empty(&self.name).await
    }

    /// Every `(key, value)` pair of the table. Entries that no longer
    /// deserialize as `T` are an error.
    pub async fn entries<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        let mut entries = Vec::new();
        for key in self.keys().await? {
            if let Some(value) = self.get_item(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Metadata {
        active_account_id: String,
        account_ids: Vec<String>,
    }

    #[tokio::test]
    async fn test_typed_roundtrip() {
        let table = Table::new(Arc::new(MemoryStorage::new()), "accountsMetadata");
        let metadata = Metadata {
            active_account_id: "a".to_string(),
            account_ids: vec!["a".to_string(), "b".to_string()],
        };

        table.set_item("metadata", &metadata).await.unwrap();
        let back: Option<Metadata> = table.get_item("metadata").await.unwrap();
        assert_eq!(back, Some(metadata));
        assert!(table.contains("metadata").await.unwrap());

        let missing: Option<Metadata> = table.get_item("missing").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let table = Table::new(Arc::new(MemoryStorage::new()), "t");
        table.set_item("k", "not a number").await.unwrap();

        assert!(table.get_item::<u64>("k").await.is_err());
    }
}
