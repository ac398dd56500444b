//! Comment store: fetch once, then follow live updates.

use crate::accounts::AccountsStore;
use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::guard::{LiveSubscriptions, PendingFetches};
use crate::protocol::{LiveEvent, Protocol, ProtocolError};
use futures::StreamExt;
use parking_lot::RwLock;
use plebsync_cache::{CacheRegistry, LruTable};
use plebsync_core::{Account, Cid, Comment, Merge};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Name of the durable comment cache.
pub const COMMENTS_CACHE: &str = "comments";

/// Events emitted by the comment store.
#[derive(Clone, Debug)]
pub enum CommentEvent {
    /// First snapshot of a comment entered the store.
    Added(Arc<Comment>),
    /// A live update was merged.
    Updated(Arc<Comment>),
    /// The live stream of a comment reported an error.
    Error { cid: Cid, error: ProtocolError },
}

/// Latest merged snapshot of every requested comment.
pub struct CommentsStore {
    protocol: Arc<dyn Protocol>,
    cache: LruTable,
    comments: RwLock<HashMap<Cid, Arc<Comment>>>,
    errors: RwLock<HashMap<Cid, Vec<ProtocolError>>>,
    pending: PendingFetches,
    live: LiveSubscriptions,
    accounts: Option<Arc<AccountsStore>>,
    event_tx: broadcast::Sender<CommentEvent>,
}

impl CommentsStore {
    pub fn new(
        protocol: Arc<dyn Protocol>,
        caches: &CacheRegistry,
        config: &ClientConfig,
    ) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Ok(Self {
            protocol,
            cache: caches.get_or_create(COMMENTS_CACHE, config.comments_cache_size)?,
            comments: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            pending: PendingFetches::new(),
            live: LiveSubscriptions::new(),
            accounts: None,
            event_tx,
        })
    }

    /// Hand every comment entering the store, and its replies, to
    /// `accounts` for CID reconciliation.
    pub fn with_accounts(mut self, accounts: Arc<AccountsStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn get(&self, cid: &str) -> Option<Arc<Comment>> {
        self.comments.read().get(cid).cloned()
    }

    /// Errors recorded from the live stream of a comment.
    pub fn errors(&self, cid: &str) -> Vec<ProtocolError> {
        self.errors.read().get(cid).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.comments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommentEvent> {
        self.event_tx.subscribe()
    }

    /// Fetch a comment for `account` and start following it.
    ///
    /// Returns immediately when the comment is already known or a fetch for
    /// the same `(account, cid)` is in flight. A failed fetch releases the
    /// pending guard so the call can be retried.
    pub async fn add_comment_to_store(self: &Arc<Self>, cid: &str, account: &Account) -> Result<()> {
        if cid.is_empty() {
            return Err(SdkError::InvalidArgument("comment cid is empty".to_string()));
        }
        if self.comments.read().contains_key(cid) {
            return Ok(());
        }
        let Some(guard) = self.pending.try_acquire(&account.id, cid) else {
            trace!(cid, account_id = %account.id, "comment fetch already pending");
            return Ok(());
        };

        let comment = match self.cache.get_item::<Comment>(cid).await? {
            Some(comment) => {
                trace!(cid, "comment cache hit");
                comment
            }
            None => {
                let comment = self.protocol.get_comment(cid).await?;
                self.cache.set_item(cid, &comment).await?;
                debug!(cid, "fetched comment");
                comment
            }
        };
        if guard.is_stale() {
            return Ok(());
        }

        let added = {
            let mut comments = self.comments.write();
            if comments.contains_key(cid) {
                None
            } else {
                let comment = Arc::new(comment);
                comments.insert(cid.to_string(), comment.clone());
                Some(comment)
            }
        };
        if let Some(comment) = added {
            self.reconcile(&comment).await;
            let _ = self.event_tx.send(CommentEvent::Added(comment));
        }

        self.start_updates(cid);
        Ok(())
    }

    fn start_updates(self: &Arc<Self>, cid: &str) {
        let store = Arc::clone(self);
        let key = cid.to_string();
        self.live.start(cid, move |generation| {
            let mut updates = store.protocol.comment_updates(&key);
            tokio::spawn(async move {
                while let Some(event) = updates.next().await {
                    if !store.live.is_current(generation) {
                        break;
                    }
                    match event {
                        LiveEvent::Update(update) => {
                            if let Err(e) = store.apply_update(&key, update).await {
                                warn!(cid = %key, error = %e, "failed to apply comment update");
                            }
                        }
                        LiveEvent::Error(error) => store.record_error(&key, error),
                    }
                }
            })
        });
    }

    async fn apply_update(&self, cid: &str, update: Comment) -> Result<()> {
        let merged = {
            let mut comments = self.comments.write();
            let merged = match comments.get(cid) {
                Some(existing) => existing.merge(&update),
                None => update,
            };
            let merged = Arc::new(merged);
            comments.insert(cid.to_string(), merged.clone());
            merged
        };
        self.cache.set_item(cid, merged.as_ref()).await?;
        trace!(cid, "comment updated");
        self.reconcile(&merged).await;
        let _ = self.event_tx.send(CommentEvent::Updated(merged));
        Ok(())
    }

    async fn reconcile(&self, comment: &Comment) {
        if let Some(accounts) = &self.accounts {
            accounts.reconcile_comments([comment]).await;
        }
    }

    fn record_error(&self, cid: &str, error: ProtocolError) {
        warn!(cid, error = %error, "comment update error");
        self.errors
            .write()
            .entry(cid.to_string())
            .or_default()
            .push(error.clone());
        let _ = self.event_tx.send(CommentEvent::Error {
            cid: cid.to_string(),
            error,
        });
    }

    /// Stop following every comment and drop in-memory state.
    pub fn reset(&self) {
        self.live.stop_all();
        self.pending.reset();
        self.comments.write().clear();
        self.errors.write().clear();
    }

    pub async fn clear_cache(&self) -> Result<()> {
        Ok(self.cache.clear().await?)
    }
}
