//! Generational LRU tables.
//!
//! Instead of tracking per-key recency, an LRU table owns two storage tables:
//! an *active* one receiving every write, and a *standby* one holding the
//! previous generation.
//!
//! ```text
//! set(k):  active[k] = v; n += 1 (new key)
//!          n == size  =>  standby.clear(); swap(active, standby); n = 0
//! get(k):  active[k]  or  standby[k] promoted into active
//! ```
//!
//! A key survives as long as it sits in either generation, so the retained
//! set is bounded by `[size, 2 * size)` once `size` keys were written, with
//! O(1) amortized eviction and no timestamps. Reading a key from the standby
//! generation copies it forward, which is what keeps recently-read keys alive.
//!
//! On re-instantiation the roles are recovered from the table sizes: the
//! larger table is the older generation.

use crate::error::{CacheError, Result};
use crate::storage::Storage;
use crate::table::Table;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, Default)]
struct Rotation {
    initialized: bool,
    /// Index of the active table in `tables`.
    active: usize,
    /// Keys written into the active table since it became active.
    active_len: usize,
}

struct LruInner {
    name: String,
    size: usize,
    tables: [Table; 2],
    // Serializes operations so a promotion or rotation is never interleaved
    // with another write to the same instance.
    rotation: tokio::sync::Mutex<Rotation>,
}

/// Size-bounded, persistent cache handle.
#[derive(Clone)]
pub struct LruTable {
    inner: Arc<LruInner>,
}

impl LruTable {
    fn new(storage: Arc<dyn Storage>, name: &str, size: usize) -> Self {
        let tables = [
            Table::new(storage.clone(), name),
            Table::new(storage, format!("{}-2", name)),
        ];
        Self {
            inner: Arc::new(LruInner {
                name: name.to_string(),
                size,
                tables,
                rotation: tokio::sync::Mutex::new(Rotation::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, Rotation>> {
        let mut rotation = self.inner.rotation.lock().await;
        if !rotation.initialized {
            let first = self.inner.tables[0].len().await?;
            let second = self.inner.tables[1].len().await?;
            // The larger table is the older generation.
            let (active, active_len) = if first > second {
                (1, second)
            } else {
                (0, first)
            };
            *rotation = Rotation {
                initialized: true,
                active,
                active_len,
            };
            trace!(name = %self.inner.name, active, active_len, "initialized lru rotation");
        }
        Ok(rotation)
    }

    async fn insert(&self, rotation: &mut Rotation, key: &str, value: &Value) -> Result<()> {
        let active = &self.inner.tables[rotation.active];
        let is_new = !active.contains(key).await?;
        active.set_item(key, value).await?;
        if is_new {
            rotation.active_len += 1;
        }

        if rotation.active_len >= self.inner.size {
            let standby = 1 - rotation.active;
            self.inner.tables[standby].clear().await?;
            rotation.active = standby;
            rotation.active_len = 0;
            debug!(name = %self.inner.name, size = self.inner.size, "rotated lru generations");
        }
        Ok(())
    }

    /// Get a value. A hit in the standby generation is promoted.
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut rotation = self.lock().await?;
        let active = &self.inner.tables[rotation.active];
        if let Some(value) = active.get_item::<Value>(key).await? {
            return Ok(Some(serde_json::from_value(value)?));
        }

        let standby = &self.inner.tables[1 - rotation.active];
        match standby.get_item::<Value>(key).await? {
            Some(value) => {
                self.insert(&mut rotation, key, &value).await?;
                Ok(Some(serde_json::from_value(value)?))
            }
            None => Ok(None),
        }
    }

    pub async fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut rotation = self.lock().await?;
        self.insert(&mut rotation, key, &value).await
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let _rotation = self.lock().await?;
        for table in &self.inner.tables {
            table.remove_item(key).await?;
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut rotation = self.lock().await?;
        for table in &self.inner.tables {
            table.clear().await?;
        }
        rotation.active = 0;
        rotation.active_len = 0;
        Ok(())
    }

    /// Keys retained in either generation.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let _rotation = self.lock().await?;
        let mut keys = BTreeSet::new();
        for table in &self.inner.tables {
            keys.extend(table.keys().await?);
        }
        Ok(keys.into_iter().collect())
    }

    /// Retained entries; the active generation wins over stale standby copies.
    pub async fn entries<T: DeserializeOwned>(&self) -> Result<Vec<(String, T)>> {
        let rotation = self.lock().await?;
        let mut entries: BTreeMap<String, Value> = BTreeMap::new();
        let standby = &self.inner.tables[1 - rotation.active];
        let active = &self.inner.tables[rotation.active];
        for (key, value) in standby.entries::<Value>().await? {
            entries.insert(key, value);
        }
        for (key, value) in active.entries::<Value>().await? {
            entries.insert(key, value);
        }
        entries
            .into_iter()
            .map(|(key, value)| Ok((key, serde_json::from_value(value)?)))
            .collect()
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

impl fmt::Debug for LruTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruTable")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .finish()
    }
}

/// Creates LRU instances by name over one storage.
///
/// The size of an instance is fixed when it is first created.
pub struct CacheRegistry {
    storage: Arc<dyn Storage>,
    instances: Mutex<HashMap<String, LruTable>>,
}

impl CacheRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Create an instance with `Some(size)`, or fetch an existing one with
    /// `None`. Passing a size for a name that already exists is an error.
    pub fn create_instance(&self, name: &str, size: Option<usize>) -> Result<LruTable> {
        let mut instances = self.instances.lock();
        match (instances.get(name), size) {
            (Some(_), Some(_)) => Err(CacheError::AlreadyCreated(name.to_string())),
            (Some(instance), None) => Ok(instance.clone()),
            (None, None) => Err(CacheError::NotCreated(name.to_string())),
            (None, Some(0)) => Err(CacheError::InvalidSize {
                name: name.to_string(),
                size: 0,
            }),
            (None, Some(size)) => {
                let instance = LruTable::new(self.storage.clone(), name, size);
                instances.insert(name.to_string(), instance.clone());
                debug!(name, size, "created lru instance");
                Ok(instance)
            }
        }
    }

    /// Existing instance, or a new one with `size`.
    pub fn get_or_create(&self, name: &str, size: usize) -> Result<LruTable> {
        match self.create_instance(name, None) {
            Ok(instance) => Ok(instance),
            Err(CacheError::NotCreated(_)) => self.create_instance(name, Some(size)),
            Err(e) => Err(e),
        }
    }

    /// Plain, unbounded table over the same storage.
    pub fn table(&self, name: &str) -> Table {
        Table::new(self.storage.clone(), name)
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.instances.lock().keys().cloned().collect();
        f.debug_struct("CacheRegistry")
            .field("instances", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn registry() -> CacheRegistry {
        CacheRegistry::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_recently_read_keys_survive_rotation() {
        let cache = registry().create_instance("test", Some(4)).unwrap();

        for (key, value) in [("one", 1), ("two", 2), ("three", 3), ("four", 4)] {
            cache.set_item(key, &value).await.unwrap();
        }
        assert_eq!(cache.get_item::<i32>("one").await.unwrap(), Some(1));
        assert_eq!(cache.get_item::<i32>("two").await.unwrap(), Some(2));
        cache.set_item("five", &5).await.unwrap();
        cache.set_item("six", &6).await.unwrap();

        assert_eq!(cache.get_item::<i32>("one").await.unwrap(), Some(1));
        assert_eq!(cache.get_item::<i32>("two").await.unwrap(), Some(2));
        assert_eq!(cache.get_item::<i32>("three").await.unwrap(), None);
        assert_eq!(cache.get_item::<i32>("four").await.unwrap(), None);
        assert_eq!(cache.get_item::<i32>("five").await.unwrap(), Some(5));
        assert_eq!(cache.get_item::<i32>("six").await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn test_overwrite_does_not_count_twice() {
        let cache = registry().create_instance("test", Some(2)).unwrap();

        cache.set_item("a", &1).await.unwrap();
        cache.set_item("a", &2).await.unwrap();
        cache.set_item("a", &3).await.unwrap();

        assert_eq!(cache.keys().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(cache.get_item::<i32>("a").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_remove_clear_and_entries() {
        let cache = registry().create_instance("test", Some(2)).unwrap();

        cache.set_item("a", &1).await.unwrap();
        cache.set_item("b", &2).await.unwrap(); // rotates
        cache.set_item("c", &3).await.unwrap();
        assert_eq!(
            cache.entries::<i32>().await.unwrap(),
            vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]
        );

        cache.remove_item("a").await.unwrap();
        assert_eq!(cache.get_item::<i32>("a").await.unwrap(), None);
        assert_eq!(cache.len().await.unwrap(), 2);

        cache.clear().await.unwrap();
        assert!(cache.is_empty().await.unwrap());
    }

    #[test]
    fn test_size_fixed_at_creation() {
        let registry = registry();
        registry.create_instance("comments", Some(10)).unwrap();

        assert!(matches!(
            registry.create_instance("comments", Some(10)),
            Err(CacheError::AlreadyCreated(_))
        ));
        assert_eq!(registry.create_instance("comments", None).unwrap().size(), 10);
        assert!(matches!(
            registry.create_instance("pages", None),
            Err(CacheError::NotCreated(_))
        ));
        assert!(matches!(
            registry.create_instance("pages", Some(0)),
            Err(CacheError::InvalidSize { .. })
        ));
        assert_eq!(registry.get_or_create("comments", 99).unwrap().size(), 10);
    }
}
