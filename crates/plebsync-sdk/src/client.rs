//! Composition root wiring the stores together.

use crate::accounts::{AccountEvent, AccountsStore};
use crate::comments::CommentsStore;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::feeds::FeedsStore;
use crate::pages::PagesStore;
use crate::protocol::Protocol;
use crate::subplebbits::SubplebbitsStore;
use plebsync_cache::{CacheRegistry, Storage};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The plebsync client.
///
/// Owns every store. The entity stores hand what they add to the account
/// store directly, before announcing it:
///
/// | source                          | effect                                   |
/// |---------------------------------|------------------------------------------|
/// | comment added / updated         | CID reconciliation (comment and replies) |
/// | subplebbit added / updated      | role derivation, inline CID reconciliation |
/// | page added                      | CID reconciliation                       |
///
/// Bridge tasks carry only feed recomputation, which is idempotent:
///
/// | source                          | effect                                   |
/// |---------------------------------|------------------------------------------|
/// | subplebbit added / updated      | feed recomputation                       |
/// | page added                      | feed recomputation                       |
/// | account list or active changed  | feed recomputation                       |
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use plebsync_cache::MemoryStorage;
/// use plebsync_sdk::{Client, ClientConfig, MemoryProtocol, SortType};
///
/// let client = Client::open(
///     Arc::new(MemoryProtocol::new()),
///     Arc::new(MemoryStorage::new()),
///     ClientConfig::default(),
/// )
/// .await?;
///
/// let account = client.accounts().active_account()?;
/// let key = client
///     .feeds()
///     .add_feed_to_store(&account, ["news.eth"], SortType::Hot, false)?;
/// ```
pub struct Client {
    config: ClientConfig,
    caches: Arc<CacheRegistry>,
    accounts: Arc<AccountsStore>,
    comments: Arc<CommentsStore>,
    subplebbits: Arc<SubplebbitsStore>,
    pages: Arc<PagesStore>,
    feeds: Arc<FeedsStore>,
    bridges: Vec<JoinHandle<()>>,
}

impl Client {
    /// Build the stores over `storage`, load the accounts and start the
    /// bridges.
    pub async fn open(
        protocol: Arc<dyn Protocol>,
        storage: Arc<dyn Storage>,
        config: ClientConfig,
    ) -> Result<Self> {
        let caches = Arc::new(CacheRegistry::new(storage));
        let accounts = AccountsStore::open(protocol.clone(), caches.clone(), &config).await?;
        let comments = Arc::new(
            CommentsStore::new(protocol.clone(), &caches, &config)?.with_accounts(accounts.clone()),
        );
        let subplebbits = Arc::new(
            SubplebbitsStore::new(protocol.clone(), &caches, &config).with_accounts(accounts.clone()),
        );
        let pages =
            Arc::new(PagesStore::new(protocol, &caches, &config)?.with_accounts(accounts.clone()));
        let feeds = Arc::new(FeedsStore::new(
            accounts.clone(),
            subplebbits.clone(),
            pages.clone(),
            &config,
        ));

        let resync = {
            let feeds = feeds.clone();
            move || feeds.schedule_update()
        };
        let bridges = vec![
            bridge("subplebbits", subplebbits.subscribe(), resync.clone(), {
                let feeds = feeds.clone();
                move |_| {
                    feeds.schedule_update();
                    async {}
                }
            }),
            bridge("pages", pages.subscribe(), resync.clone(), {
                let feeds = feeds.clone();
                move |_| {
                    feeds.schedule_update();
                    async {}
                }
            }),
            bridge("accounts", accounts.subscribe_events(), resync, {
                let feeds = feeds.clone();
                move |event| {
                    let feeds = feeds.clone();
                    async move {
                        if matches!(
                            event,
                            AccountEvent::AccountsChanged | AccountEvent::ActiveAccountChanged(_)
                        ) {
                            feeds.schedule_update();
                        }
                    }
                }
            }),
        ];
        info!(accounts = accounts.accounts().len(), "client opened");

        Ok(Self {
            config,
            caches,
            accounts,
            comments,
            subplebbits,
            pages,
            feeds,
            bridges,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CacheRegistry> {
        &self.caches
    }

    pub fn accounts(&self) -> &Arc<AccountsStore> {
        &self.accounts
    }

    pub fn comments(&self) -> &Arc<CommentsStore> {
        &self.comments
    }

    pub fn subplebbits(&self) -> &Arc<SubplebbitsStore> {
        &self.subplebbits
    }

    pub fn pages(&self) -> &Arc<PagesStore> {
        &self.pages
    }

    pub fn feeds(&self) -> &Arc<FeedsStore> {
        &self.feeds
    }

    /// Stop every live stream and publish driver and drop all in-memory
    /// state. Accounts are reloaded from storage.
    pub async fn reset(&self) -> Result<()> {
        self.feeds.reset();
        self.comments.reset();
        self.subplebbits.reset();
        self.pages.reset();
        self.accounts.reset().await?;
        info!("client reset");
        Ok(())
    }

    /// Clear the durable entity caches. Account data is kept.
    pub async fn clear_caches(&self) -> Result<()> {
        self.comments.clear_cache().await?;
        self.subplebbits.clear_cache().await?;
        self.pages.clear_cache().await?;
        info!("caches cleared");
        Ok(())
    }

    /// Stop the bridges between stores.
    pub fn shutdown(&self) {
        for bridge in &self.bridges {
            bridge.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Forward every event of `events` to `handle`, in order. After a lag,
/// `resync` runs in place of the skipped events.
fn bridge<E, F, Fut, R>(
    name: &'static str,
    mut events: broadcast::Receiver<E>,
    resync: R,
    handle: F,
) -> JoinHandle<()>
where
    E: Clone + Send + 'static,
    F: Fn(E) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    R: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => handle(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(bridge = name, skipped, "bridge lagged behind");
                    resync();
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
