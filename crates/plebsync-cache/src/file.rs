//! File-backed storage.
//!
//! One JSON document per table inside a directory. Tables are loaded lazily on
//! first access and written through on every mutation (temp file + rename, so
//! a crash never leaves a half-written table behind).

use crate::error::Result;
use crate::storage::Storage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, trace};

type TableData = BTreeMap<String, Value>;

/// Directory-backed implementation of [`Storage`].
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    // One lock for loads and writes: writes to a table must hit the disk in
    // the order they were applied in memory.
    tables: Mutex<HashMap<String, TableData>>,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "opened file storage");
        Ok(Self {
            dir,
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, table: &str) -> PathBuf {
        let file_name: String = table
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    async fn load(&self, table: &str) -> Result<TableData> {
        let path = self.table_path(table);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                trace!(table, bytes = bytes.len(), "loaded table");
                Ok(serde_json::from_slice(&bytes)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TableData::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, table: &str, data: &TableData) -> Result<()> {
        let path = self.table_path(table);
        if data.is_empty() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(data)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Run `f` against a loaded table, then write it back when `f` says so.
    async fn with_table<R>(
        &self,
        table: &str,
        f: impl FnOnce(&mut TableData) -> (R, bool),
    ) -> Result<R> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(table) {
            let data = self.load(table).await?;
            tables.insert(table.to_string(), data);
        }
        let data = tables.entry(table.to_string()).or_default();
        let (result, dirty) = f(data);
        if dirty {
            self.persist(table, data).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        self.with_table(table, |data| (data.get(key).cloned(), false))
            .await
    }

    async fn set(&self, table: &str, key: &str, value: Value) -> Result<()> {
        self.with_table(table, |data| {
            data.insert(key.to_string(), value);
            ((), true)
        })
        .await
    }

    async fn remove(&self, table: &str, key: &str) -> Result<()> {
        self.with_table(table, |data| ((), data.remove(key).is_some()))
            .await
    }

    async fn clear(&self, table: &str) -> Result<()> {
        self.with_table(table, |data| {
            let dirty = !data.is_empty();
            data.clear();
            ((), dirty)
        })
        .await
    }

    async fn keys(&self, table: &str) -> Result<Vec<String>> {
        self.with_table(table, |data| (data.keys().cloned().collect(), false))
            .await
    }

    async fn len(&self, table: &str) -> Result<usize> {
        self.with_table(table, |data| (data.len(), false)).await
    }
}
