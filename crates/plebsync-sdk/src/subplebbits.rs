//! Subplebbit store: fetch once, then follow live updates.

use crate::accounts::AccountsStore;
use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::guard::{LiveSubscriptions, PendingFetches};
use crate::protocol::{LiveEvent, Protocol, ProtocolError, SubplebbitOptions};
use futures::StreamExt;
use parking_lot::RwLock;
use plebsync_cache::{CacheRegistry, Table};
use plebsync_core::{Account, Merge, Subplebbit};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

/// Name of the durable subplebbit table.
pub const SUBPLEBBITS_TABLE: &str = "subplebbits";

#[derive(Clone, Debug)]
pub enum SubplebbitEvent {
    Added(Arc<Subplebbit>),
    Updated(Arc<Subplebbit>),
    Error { address: String, error: ProtocolError },
}

/// Latest merged snapshot of every requested subplebbit.
pub struct SubplebbitsStore {
    protocol: Arc<dyn Protocol>,
    table: Table,
    subplebbits: RwLock<HashMap<String, Arc<Subplebbit>>>,
    errors: RwLock<HashMap<String, Vec<ProtocolError>>>,
    pending: PendingFetches,
    live: LiveSubscriptions,
    accounts: Option<Arc<AccountsStore>>,
    event_tx: broadcast::Sender<SubplebbitEvent>,
}

impl SubplebbitsStore {
    pub fn new(protocol: Arc<dyn Protocol>, caches: &CacheRegistry, config: &ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            protocol,
            table: caches.table(SUBPLEBBITS_TABLE),
            subplebbits: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            pending: PendingFetches::new(),
            live: LiveSubscriptions::new(),
            accounts: None,
            event_tx,
        }
    }

    /// Derive the roles of `accounts` from every snapshot entering the
    /// store, and reconcile the comments of its inline pages.
    pub fn with_accounts(mut self, accounts: Arc<AccountsStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn get(&self, address: &str) -> Option<Arc<Subplebbit>> {
        self.subplebbits.read().get(address).cloned()
    }

    pub fn errors(&self, address: &str) -> Vec<ProtocolError> {
        self.errors.read().get(address).cloned().unwrap_or_default()
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<_> = self.subplebbits.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubplebbitEvent> {
        self.event_tx.subscribe()
    }

    /// Fetch a subplebbit for `account` and start following it.
    pub async fn add_subplebbit_to_store(
        self: &Arc<Self>,
        address: &str,
        account: &Account,
    ) -> Result<()> {
        if address.is_empty() {
            return Err(SdkError::InvalidArgument(
                "subplebbit address is empty".to_string(),
            ));
        }
        if self.subplebbits.read().contains_key(address) {
            return Ok(());
        }
        let Some(guard) = self.pending.try_acquire(&account.id, address) else {
            trace!(address, account_id = %account.id, "subplebbit fetch already pending");
            return Ok(());
        };

        let subplebbit = match self.table.get_item::<Subplebbit>(address).await? {
            Some(subplebbit) => {
                trace!(address, "subplebbit cache hit");
                subplebbit
            }
            None => {
                let subplebbit = self.protocol.get_subplebbit(address).await?;
                self.table.set_item(address, &subplebbit).await?;
                debug!(address, "fetched subplebbit");
                subplebbit
            }
        };
        if guard.is_stale() {
            return Ok(());
        }

        self.insert(address, subplebbit).await;
        self.start_updates(address);
        Ok(())
    }

    /// Create a subplebbit owned by `account` and start following it.
    pub async fn create_subplebbit(
        self: &Arc<Self>,
        options: SubplebbitOptions,
        account: &Account,
    ) -> Result<Arc<Subplebbit>> {
        let subplebbit = self
            .protocol
            .create_subplebbit(&account.signer, &options)
            .await?;
        let address = subplebbit.address.clone();
        self.table.set_item(&address, &subplebbit).await?;
        info!(address = %address, account_id = %account.id, "created subplebbit");

        let subplebbit = self.insert(&address, subplebbit).await;
        self.start_updates(&address);
        Ok(subplebbit)
    }

    async fn sync_accounts(&self, subplebbit: &Subplebbit) {
        let Some(accounts) = &self.accounts else {
            return;
        };
        if let Err(e) = accounts
            .add_subplebbit_role_to_accounts_subplebbits(subplebbit)
            .await
        {
            warn!(address = %subplebbit.address, error = %e, "failed to derive roles");
        }
        if let Some(posts) = &subplebbit.posts {
            accounts.reconcile_comments(posts.inline_comments()).await;
        }
    }

    /// Insert the first snapshot unless a concurrent fetch won the race.
    async fn insert(&self, address: &str, subplebbit: Subplebbit) -> Arc<Subplebbit> {
        let added = {
            let mut subplebbits = self.subplebbits.write();
            if let Some(existing) = subplebbits.get(address) {
                return existing.clone();
            }
            let subplebbit = Arc::new(subplebbit);
            subplebbits.insert(address.to_string(), subplebbit.clone());
            subplebbit
        };
        self.sync_accounts(&added).await;
        let _ = self.event_tx.send(SubplebbitEvent::Added(added.clone()));
        added
    }

    fn start_updates(self: &Arc<Self>, address: &str) {
        let store = Arc::clone(self);
        let key = address.to_string();
        self.live.start(address, move |generation| {
            let mut updates = store.protocol.subplebbit_updates(&key);
            tokio::spawn(async move {
                while let Some(event) = updates.next().await {
                    if !store.live.is_current(generation) {
                        break;
                    }
                    match event {
                        LiveEvent::Update(update) => {
                            if let Err(e) = store.apply_update(&key, update).await {
                                warn!(address = %key, error = %e, "failed to apply subplebbit update");
                            }
                        }
                        LiveEvent::Error(error) => store.record_error(&key, error),
                    }
                }
            })
        });
    }

    async fn apply_update(&self, address: &str, update: Subplebbit) -> Result<()> {
        let merged = {
            let mut subplebbits = self.subplebbits.write();
            let merged = match subplebbits.get(address) {
                Some(existing) => existing.merge(&update),
                None => update,
            };
            let merged = Arc::new(merged);
            subplebbits.insert(address.to_string(), merged.clone());
            merged
        };
        self.table.set_item(address, merged.as_ref()).await?;
        trace!(address, "subplebbit updated");
        self.sync_accounts(&merged).await;
        let _ = self.event_tx.send(SubplebbitEvent::Updated(merged));
        Ok(())
    }

    fn record_error(&self, address: &str, error: ProtocolError) {
        warn!(address, error = %error, "subplebbit update error");
        self.errors
            .write()
            .entry(address.to_string())
            .or_default()
            .push(error.clone());
        let _ = self.event_tx.send(SubplebbitEvent::Error {
            address: address.to_string(),
            error,
        });
    }

    pub fn reset(&self) {
        self.live.stop_all();
        self.pending.reset();
        self.subplebbits.write().clear();
        self.errors.write().clear();
    }

    pub async fn clear_cache(&self) -> Result<()> {
        Ok(self.table.clear().await?)
    }
}
