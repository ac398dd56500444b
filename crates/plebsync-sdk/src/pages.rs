//! Page accumulator.
//!
//! Builds, per subplebbit and sort type, the linked list of post pages one
//! page at a time:
//!
//! ```text
//! entry point ──> [page 1] ──next_cid──> [page 2] ──next_cid──> ... [tail]
//!                                                                  │
//!                     add_next_page_to_store fetches tail.next_cid ┘
//! ```
//!
//! Pages are never evicted from memory; only the durable cache beneath
//! (`subplebbitsPages`) is bounded.

use crate::accounts::AccountsStore;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::guard::PendingFetches;
use crate::protocol::Protocol;
use parking_lot::RwLock;
use plebsync_cache::{CacheRegistry, LruTable};
use plebsync_core::{Account, Cid, EntryPoint, Page, SortType, Subplebbit};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Name of the durable page cache.
pub const PAGES_CACHE: &str = "subplebbitsPages";

/// A page entered the store.
#[derive(Clone, Debug)]
pub struct PageAdded {
    pub page_cid: Cid,
    pub subplebbit_address: String,
    pub sort_type: SortType,
    pub page: Arc<Page>,
}

pub struct PagesStore {
    protocol: Arc<dyn Protocol>,
    cache: LruTable,
    pages: RwLock<HashMap<Cid, Arc<Page>>>,
    pending: PendingFetches,
    accounts: Option<Arc<AccountsStore>>,
    event_tx: broadcast::Sender<PageAdded>,
}

impl PagesStore {
    pub fn new(
        protocol: Arc<dyn Protocol>,
        caches: &CacheRegistry,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Ok(Self {
            protocol,
            cache: caches.get_or_create(PAGES_CACHE, config.pages_cache_size)?,
            pages: RwLock::new(HashMap::new()),
            pending: PendingFetches::new(),
            accounts: None,
            event_tx,
        })
    }

    /// Hand the comments of every added page to `accounts` for CID
    /// reconciliation before the page is announced.
    pub fn with_accounts(mut self, accounts: Arc<AccountsStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn get(&self, page_cid: &str) -> Option<Arc<Page>> {
        self.pages.read().get(page_cid).cloned()
    }

    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageAdded> {
        self.event_tx.subscribe()
    }

    /// Pages of a subplebbit for `sort_type`, from the entry point to the
    /// last page in the store.
    pub fn subplebbit_pages(&self, subplebbit: &Subplebbit, sort_type: SortType) -> Vec<Arc<Page>> {
        let pages = self.pages.read();
        let mut walked = Vec::new();
        let mut next = match subplebbit.entry_point(sort_type) {
            None => return walked,
            Some(EntryPoint::Inline(page)) => {
                walked.push(Arc::new(page.clone()));
                page.next_cid.clone()
            }
            Some(EntryPoint::Cid(cid)) => Some(cid.clone()),
        };

        let mut visited = HashSet::new();
        while let Some(cid) = next {
            if !visited.insert(cid.clone()) {
                break;
            }
            match pages.get(&cid) {
                Some(page) => {
                    next = page.next_cid.clone();
                    walked.push(page.clone());
                }
                None => break,
            }
        }
        walked
    }

    /// CID of the page after the current tail, `None` at the end of the list
    /// or when the subplebbit has no posts for `sort_type`.
    pub fn next_page_cid(&self, subplebbit: &Subplebbit, sort_type: SortType) -> Option<Cid> {
        match self.subplebbit_pages(subplebbit, sort_type).last() {
            Some(tail) => tail.next_cid.clone(),
            None => match subplebbit.entry_point(sort_type) {
                Some(EntryPoint::Cid(cid)) => Some(cid.clone()),
                _ => None,
            },
        }
    }

    /// Whether more pages of `sort_type` can still be fetched.
    pub fn has_next_page(&self, subplebbit: &Subplebbit, sort_type: SortType) -> bool {
        self.next_page_cid(subplebbit, sort_type).is_some()
    }

    /// Fetch exactly one page beyond the current tail.
    ///
    /// A no-op at the end of the list, or while the same page is already
    /// being fetched for `account`.
    pub async fn add_next_page_to_store(
        &self,
        subplebbit: &Subplebbit,
        sort_type: SortType,
        account: &Account,
    ) -> Result<()> {
        let address = subplebbit.address.as_str();
        let Some(page_cid) = self.next_page_cid(subplebbit, sort_type) else {
            trace!(address, sort_type = %sort_type, "no next page");
            return Ok(());
        };
        if self.pages.read().contains_key(&page_cid) {
            return Ok(());
        }
        let Some(guard) = self.pending.try_acquire(&account.id, &page_cid) else {
            trace!(address, page_cid = %page_cid, "page fetch already pending");
            return Ok(());
        };

        let page = match self.cache.get_item::<Page>(&page_cid).await? {
            Some(page) => {
                trace!(page_cid = %page_cid, "page cache hit");
                page
            }
            None => {
                let page = self.protocol.get_page(address, &page_cid).await?;
                self.cache.set_item(&page_cid, &page).await?;
                page
            }
        };
        if guard.is_stale() {
            return Ok(());
        }

        debug!(
            address,
            sort_type = %sort_type,
            page_cid = %page_cid,
            comments = page.comments.len(),
            "added page"
        );
        let page = Arc::new(page);
        self.pages.write().insert(page_cid.clone(), page.clone());
        if let Some(accounts) = &self.accounts {
            accounts.reconcile_comments(&page.comments).await;
        }
        let _ = self.event_tx.send(PageAdded {
            page_cid,
            subplebbit_address: subplebbit.address.clone(),
            sort_type,
            page,
        });
        Ok(())
    }

    pub fn reset(&self) {
        self.pending.reset();
        self.pages.write().clear();
    }

    pub async fn clear_cache(&self) -> Result<()> {
        Ok(self.cache.clear().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryProtocol;
    use plebsync_cache::MemoryStorage;
    use plebsync_core::{Author, Comment, CommentContent, Pages, Signer};

    fn account() -> Account {
        Account::new(
            "Account 1",
            Signer {
                private_key: "key".to_string(),
                address: "12D3KooWReader".to_string(),
                kind: "ed25519".to_string(),
            },
        )
    }

    fn page(prefix: &str, next_cid: Option<&str>) -> Page {
        let comments = (0..3)
            .map(|i| {
                Comment::new(
                    format!("{}-{}", prefix, i),
                    CommentContent {
                        subplebbit_address: "news.eth".to_string(),
                        author: Author::new("12D3KooWAuthor"),
                        timestamp: 1_700_000_000 + i,
                        ..Default::default()
                    },
                )
            })
            .collect();
        Page::new(comments, next_cid.map(str::to_string))
    }

    fn setup() -> (MemoryProtocol, PagesStore, Subplebbit) {
        let protocol = MemoryProtocol::new();
        protocol.add_page("QmPage1", page("a", Some("QmPage2")));
        protocol.add_page("QmPage2", page("b", None));

        let mut subplebbit = Subplebbit::new("news.eth");
        let mut posts = Pages::default();
        posts.page_cids.insert(SortType::Hot, "QmPage1".to_string());
        subplebbit.posts = Some(posts);

        let caches = CacheRegistry::new(Arc::new(MemoryStorage::new()));
        let store =
            PagesStore::new(Arc::new(protocol.clone()), &caches, &ClientConfig::default()).unwrap();
        (protocol, store, subplebbit)
    }

    #[tokio::test]
    async fn test_walk_is_forward_only_and_stops_at_end() {
        let (protocol, store, subplebbit) = setup();
        let account = account();

        for _ in 0..5 {
            store
                .add_next_page_to_store(&subplebbit, SortType::Hot, &account)
                .await
                .unwrap();
        }

        assert_eq!(protocol.page_fetches("QmPage1"), 1);
        assert_eq!(protocol.page_fetches("QmPage2"), 1);
        assert_eq!(store.subplebbit_pages(&subplebbit, SortType::Hot).len(), 2);
        assert!(!store.has_next_page(&subplebbit, SortType::Hot));
    }

    #[tokio::test]
    async fn test_inline_page_is_the_first_page() {
        let (protocol, store, mut subplebbit) = setup();
        if let Some(posts) = subplebbit.posts.as_mut() {
            posts
                .pages
                .insert(SortType::Hot, page("inline", Some("QmPage2")));
        }

        assert_eq!(store.subplebbit_pages(&subplebbit, SortType::Hot).len(), 1);
        store
            .add_next_page_to_store(&subplebbit, SortType::Hot, &account())
            .await
            .unwrap();

        assert_eq!(protocol.page_fetches("QmPage1"), 0);
        assert_eq!(protocol.page_fetches("QmPage2"), 1);
        assert_eq!(store.subplebbit_pages(&subplebbit, SortType::Hot).len(), 2);
    }

    #[tokio::test]
    async fn test_no_entry_point_is_a_no_op() {
        let (_, store, subplebbit) = setup();
        store
            .add_next_page_to_store(&subplebbit, SortType::New, &account())
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_page_added_event() {
        let (_, store, subplebbit) = setup();
        let mut events = store.subscribe();

        store
            .add_next_page_to_store(&subplebbit, SortType::Hot, &account())
            .await
            .unwrap();

        let added = events.recv().await.unwrap();
        assert_eq!(added.page_cid, "QmPage1");
        assert_eq!(added.subplebbit_address, "news.eth");
        assert_eq!(added.page.comments.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_calls_fetch_once() {
        let (protocol, store, subplebbit) = setup();
        let account = account();

        let (first, second) = tokio::join!(
            store.add_next_page_to_store(&subplebbit, SortType::Hot, &account),
            store.add_next_page_to_store(&subplebbit, SortType::Hot, &account)
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(protocol.page_fetches("QmPage1"), 1);
        assert_eq!(protocol.page_fetches("QmPage2"), 0);
    }
}
