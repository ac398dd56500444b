#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::RwLock;
use plebsync_cache::{CacheError, MemoryStorage, Storage};
use plebsync_sdk::{
    Author, Client, ClientConfig, Comment, MemoryProtocol, Page, SortType, Subplebbit,
};
use plebsync_core::{CommentContent, CommentUpdate, Pages};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const BASE_TIMESTAMP: i64 = 1_700_000_000;

/// Poll `condition` until it holds, failing after five seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

pub fn fast_config() -> ClientConfig {
    ClientConfig::builder()
        .feeds_update_interval(Duration::from_millis(5))
        .build()
}

pub async fn open(protocol: &MemoryProtocol) -> Client {
    open_with(protocol, Arc::new(MemoryStorage::new()), fast_config()).await
}

pub async fn open_with(
    protocol: &MemoryProtocol,
    storage: Arc<dyn Storage>,
    config: ClientConfig,
) -> Client {
    Client::open(Arc::new(protocol.clone()), storage, config)
        .await
        .unwrap()
}

/// The `index`-th newest post of `address`.
pub fn post(address: &str, index: usize, author: &str) -> Comment {
    Comment {
        cid: format!("Qm{}-{}", address, index),
        content: CommentContent {
            subplebbit_address: address.to_string(),
            author: Author::new(author),
            timestamp: BASE_TIMESTAMP - index as i64,
            title: Some(format!("post {}", index)),
            depth: Some(0),
            ..Default::default()
        },
        update: CommentUpdate::default(),
    }
}

pub fn page_cid(address: &str, page: usize) -> String {
    format!("Qm{}-page{}", address, page)
}

/// Publish `address` with `pages` linked pages of `per_page` posts each,
/// reachable from the `New` and `Hot` entry points.
pub fn seed_subplebbit(protocol: &MemoryProtocol, address: &str, pages: usize, per_page: usize) {
    for page in 0..pages {
        let comments = (0..per_page)
            .map(|i| post(address, page * per_page + i, "12D3KooWAuthor"))
            .collect();
        let next = (page + 1 < pages).then(|| page_cid(address, page + 1));
        protocol.add_page(page_cid(address, page), Page::new(comments, next));
    }

    let mut subplebbit = Subplebbit::new(address);
    let mut posts = Pages::default();
    if pages > 0 {
        posts.page_cids.insert(SortType::New, page_cid(address, 0));
        posts.page_cids.insert(SortType::Hot, page_cid(address, 0));
    }
    subplebbit.posts = Some(posts);
    protocol.add_subplebbit(subplebbit);
}

/// Memory storage whose writes to tables with a given name prefix can be
/// held back until released, or refused.
pub struct ControlledStorage {
    inner: MemoryStorage,
    hold: watch::Sender<Option<String>>,
    refuse: RwLock<Option<String>>,
    held: AtomicUsize,
}

impl ControlledStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStorage::new(),
            hold: watch::channel(None).0,
            refuse: RwLock::new(None),
            held: AtomicUsize::new(0),
        })
    }

    /// Park writes to tables starting with `prefix` until `release`.
    pub fn hold_writes(&self, prefix: &str) {
        self.hold.send_replace(Some(prefix.to_string()));
    }

    pub fn release(&self) {
        self.hold.send_replace(None);
    }

    /// Number of writes that have been parked so far.
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    /// Fail writes to tables starting with `prefix`; `None` accepts all.
    pub fn refuse_writes(&self, prefix: Option<&str>) {
        *self.refuse.write() = prefix.map(str::to_string);
    }
}

fn has_prefix(prefix: Option<&str>, table: &str) -> bool {
    prefix.is_some_and(|prefix| table.starts_with(prefix))
}

#[async_trait]
impl Storage for ControlledStorage {
    async fn get(&self, table: &str, key: &str) -> plebsync_cache::Result<Option<Value>> {
        self.inner.get(table, key).await
    }

    async fn set(&self, table: &str, key: &str, value: Value) -> plebsync_cache::Result<()> {
        if has_prefix(self.refuse.read().as_deref(), table) {
            return Err(CacheError::Storage(format!("write to {} refused", table)));
        }
        let mut hold = self.hold.subscribe();
        let parked = has_prefix(hold.borrow().as_deref(), table);
        if parked {
            self.held.fetch_add(1, Ordering::SeqCst);
            let _ = hold
                .wait_for(|prefix| !has_prefix(prefix.as_deref(), table))
                .await;
        }
        self.inner.set(table, key, value).await
    }

    async fn remove(&self, table: &str, key: &str) -> plebsync_cache::Result<()> {
        self.inner.remove(table, key).await
    }

    async fn clear(&self, table: &str) -> plebsync_cache::Result<()> {
        self.inner.clear(table).await
    }

    async fn keys(&self, table: &str) -> plebsync_cache::Result<Vec<String>> {
        self.inner.keys(table).await
    }

    async fn len(&self, table: &str) -> plebsync_cache::Result<usize> {
        self.inner.len(table).await
    }
}
