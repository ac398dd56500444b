//! Account store.
//!
//! Owns the local identities, their publication logs, notifications and
//! derived subplebbit roles. All state lives behind one lock; every mutation
//! is a read-modify-write against the current state and is persisted after
//! the lock is released.
//!
//! Comments published by an account have no CID until the network confirms
//! them. The store learns it either from the publish verification or, when
//! the network withholds it, by reconciling fetched comments against the
//! unconfirmed log entries (see [`AccountsStore::add_cid_to_account_comment`]).

mod database;
mod publish;

pub use publish::{ChallengeAnswerer, CommentOptions, PublishCallbacks, PublishHandle, PublishState};

use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::guard::LiveSubscriptions;
use crate::protocol::{LiveEvent, Protocol};
use database::{AccountsDatabase, AccountsMetadata};
use futures::StreamExt;
use parking_lot::RwLock;
use plebsync_cache::CacheRegistry;
use plebsync_core::{
    Account, AccountComment, AccountCommentReply, AccountId, AccountSubplebbit, AccountVote, Cid,
    Comment, Merge, Role, RoleKind, Subplebbit,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccountEvent {
    /// An account was created, deleted, renamed or edited, or the order changed.
    AccountsChanged,
    ActiveAccountChanged(AccountId),
    CommentsChanged(AccountId),
    VotesChanged(AccountId),
    RepliesChanged(AccountId),
}

/// Portable form of an account produced by `export_account`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedAccount {
    pub account: Account,
    #[serde(default)]
    pub account_comments: Vec<AccountComment>,
    #[serde(default)]
    pub account_votes: Vec<AccountVote>,
}

#[derive(Default)]
struct AccountsState {
    accounts: HashMap<AccountId, Account>,
    metadata: AccountsMetadata,
    comments: HashMap<AccountId, Vec<AccountComment>>,
    votes: HashMap<AccountId, Vec<AccountVote>>,
    replies: HashMap<AccountId, BTreeMap<Cid, AccountCommentReply>>,
    /// Confirmed comment CID -> (account, log index).
    comment_cids: HashMap<Cid, (AccountId, usize)>,
}

impl AccountsState {
    /// The named account, or the active one.
    fn resolve(&self, name: Option<&str>) -> Result<AccountId> {
        match name {
            None => self
                .metadata
                .active_account_id
                .clone()
                .ok_or_else(|| SdkError::AccountNotFound("no active account".to_string())),
            Some(name) => self
                .metadata
                .account_names_to_account_ids
                .get(name)
                .cloned()
                .ok_or_else(|| SdkError::AccountNotFound(name.to_string())),
        }
    }

    fn account(&self, name: Option<&str>) -> Result<&Account> {
        let id = self.resolve(name)?;
        self.account_by_id(&id)
    }

    fn account_by_id(&self, id: &AccountId) -> Result<&Account> {
        self.accounts
            .get(id)
            .ok_or_else(|| SdkError::AccountNotFound(id.to_string()))
    }

    fn name_taken(&self, name: &str) -> bool {
        self.metadata.account_names_to_account_ids.contains_key(name)
    }

    /// "Account N" for the first free N counting from the number of accounts.
    fn default_name(&self) -> String {
        let mut n = self.metadata.account_ids.len() + 1;
        loop {
            let name = format!("Account {}", n);
            if !self.name_taken(&name) {
                return name;
            }
            n += 1;
        }
    }

    /// `base`, or `base 2`, `base 3`, ... when taken.
    fn unique_name(&self, base: &str) -> String {
        if !self.name_taken(base) {
            return base.to_string();
        }
        let mut n = 2;
        loop {
            let name = format!("{} {}", base, n);
            if !self.name_taken(&name) {
                return name;
            }
            n += 1;
        }
    }

    fn insert_account(&mut self, account: Account) {
        let id = account.id.clone();
        self.metadata.account_ids.push(id.clone());
        self.metadata
            .account_names_to_account_ids
            .insert(account.name.clone(), id.clone());
        self.comments.entry(id.clone()).or_default();
        self.votes.entry(id.clone()).or_default();
        self.replies.entry(id.clone()).or_default();
        self.accounts.insert(id, account);
    }

    fn index_comments(&mut self, account_id: &AccountId) {
        for comment in self.comments.get(account_id).into_iter().flatten() {
            if let Some(cid) = &comment.cid {
                self.comment_cids
                    .insert(cid.clone(), (account_id.clone(), comment.index));
            }
        }
    }

    /// Every confirmed comment as `(account, index, cid)`.
    fn confirmed_comments(&self) -> Vec<(AccountId, usize, Cid)> {
        self.comment_cids
            .iter()
            .map(|(cid, (account_id, index))| (account_id.clone(), *index, cid.clone()))
            .collect()
    }
}

pub struct AccountsStore {
    protocol: Arc<dyn Protocol>,
    database: AccountsDatabase,
    config: ClientConfig,
    state: RwLock<AccountsState>,
    /// Live updates of confirmed own comments, keyed `{account}/{index}`.
    live: LiveSubscriptions,
    /// Publish drivers, keyed `{account}/publish/{ulid}`.
    publishing: LiveSubscriptions,
    /// Serializes log appends so an entry is persisted before it is visible.
    appends: tokio::sync::Mutex<()>,
    event_tx: broadcast::Sender<AccountEvent>,
}

impl AccountsStore {
    /// Load the accounts, creating the default account on first run, and
    /// resume tracking every confirmed comment.
    pub async fn open(
        protocol: Arc<dyn Protocol>,
        caches: Arc<CacheRegistry>,
        config: &ClientConfig,
    ) -> Result<Arc<Self>> {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let store = Arc::new(Self {
            protocol,
            database: AccountsDatabase::new(caches, config.comment_replies_cache_size),
            config: config.clone(),
            state: RwLock::new(AccountsState::default()),
            live: LiveSubscriptions::new(),
            publishing: LiveSubscriptions::new(),
            appends: tokio::sync::Mutex::new(()),
            event_tx,
        });
        store.load().await?;
        Ok(store)
    }

    async fn load(self: &Arc<Self>) -> Result<()> {
        let mut state = AccountsState {
            metadata: self.database.metadata().await?,
            ..Default::default()
        };
        for id in state.metadata.account_ids.clone() {
            let Some(account) = self.database.account(&id).await? else {
                warn!(account_id = %id, "account listed in metadata is missing");
                continue;
            };
            state.accounts.insert(id.clone(), account);
            state
                .comments
                .insert(id.clone(), self.database.account_comments(&id).await?);
            state
                .votes
                .insert(id.clone(), self.database.account_votes(&id).await?);
            let replies = self
                .database
                .comment_replies(&id)
                .await?
                .into_iter()
                .map(|reply| (reply.comment.cid.clone(), reply))
                .collect();
            state.replies.insert(id.clone(), replies);
            state.index_comments(&id);
        }
        state
            .metadata
            .account_ids
            .retain(|id| state.accounts.contains_key(id));
        state
            .metadata
            .account_names_to_account_ids
            .retain(|_, id| state.accounts.contains_key(id));

        let active_valid = state
            .metadata
            .active_account_id
            .as_ref()
            .is_some_and(|id| state.accounts.contains_key(id));
        if !active_valid {
            state.metadata.active_account_id = state.metadata.account_ids.first().cloned();
        }
        let repaired_active = !active_valid && state.metadata.active_account_id.is_some();
        let count = state.accounts.len();
        let metadata = state.metadata.clone();
        *self.state.write() = state;

        if count == 0 {
            self.create_account(None).await?;
        } else if repaired_active {
            self.database.save_metadata(&metadata).await?;
        }
        info!(accounts = count.max(1), "loaded accounts");

        let confirmed = self.state.read().confirmed_comments();
        for (account_id, index, cid) in confirmed {
            self.start_comment_updates(&account_id, index, &cid);
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AccountEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: AccountEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Accounts in display order.
    pub fn accounts(&self) -> Vec<Account> {
        let state = self.state.read();
        state
            .metadata
            .account_ids
            .iter()
            .filter_map(|id| state.accounts.get(id).cloned())
            .collect()
    }

    /// The named account, or the active one.
    pub fn account(&self, name: Option<&str>) -> Result<Account> {
        self.state.read().account(name).cloned()
    }

    pub fn account_by_id(&self, id: &AccountId) -> Option<Account> {
        self.state.read().accounts.get(id).cloned()
    }

    pub fn active_account(&self) -> Result<Account> {
        self.account(None)
    }

    pub fn active_account_id(&self) -> Option<AccountId> {
        self.state.read().metadata.active_account_id.clone()
    }

    pub fn account_comments(&self, name: Option<&str>) -> Result<Vec<AccountComment>> {
        let state = self.state.read();
        let id = state.resolve(name)?;
        Ok(state.comments.get(&id).cloned().unwrap_or_default())
    }

    /// The log entry of a confirmed own comment.
    pub fn account_comment(&self, cid: &str) -> Option<AccountComment> {
        let state = self.state.read();
        let (account_id, index) = state.comment_cids.get(cid)?;
        state.comments.get(account_id)?.get(*index).cloned()
    }

    /// Latest vote per comment CID.
    pub fn account_votes(&self, name: Option<&str>) -> Result<BTreeMap<Cid, AccountVote>> {
        let state = self.state.read();
        let id = state.resolve(name)?;
        Ok(state
            .votes
            .get(&id)
            .into_iter()
            .flatten()
            .map(|vote| (vote.comment_cid.clone(), vote.clone()))
            .collect())
    }

    /// Replies to the account's comments, newest first.
    pub fn notifications(&self, name: Option<&str>) -> Result<Vec<AccountCommentReply>> {
        let state = self.state.read();
        let id = state.resolve(name)?;
        let mut replies: Vec<_> = state
            .replies
            .get(&id)
            .into_iter()
            .flat_map(|replies| replies.values().cloned())
            .collect();
        replies.sort_by(|a, b| {
            b.comment
                .timestamp()
                .cmp(&a.comment.timestamp())
                .then_with(|| a.comment.cid.cmp(&b.comment.cid))
        });
        Ok(replies)
    }

    pub async fn create_account(&self, name: Option<&str>) -> Result<Account> {
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(SdkError::InvalidArgument("account name is empty".to_string()));
            }
            if self.state.read().name_taken(name) {
                return Err(SdkError::DuplicateAccountName(name.to_string()));
            }
        }
        let signer = self.protocol.create_signer().await?;

        let (account, metadata, activated) = {
            let mut state = self.state.write();
            let name = match name {
                Some(name) if state.name_taken(name) => {
                    return Err(SdkError::DuplicateAccountName(name.to_string()))
                }
                Some(name) => name.to_string(),
                None => state.default_name(),
            };
            let account = Account::new(name, signer);
            state.insert_account(account.clone());
            let activated = state.metadata.active_account_id.is_none();
            if activated {
                state.metadata.active_account_id = Some(account.id.clone());
            }
            (account, state.metadata.clone(), activated)
        };
        self.database.save_account(&account).await?;
        self.database.save_metadata(&metadata).await?;
        info!(account_id = %account.id, name = %account.name, "created account");

        self.emit(AccountEvent::AccountsChanged);
        if activated {
            self.emit(AccountEvent::ActiveAccountChanged(account.id.clone()));
        }
        Ok(account)
    }

    /// Delete an account with its logs. The active account moves to the first
    /// remaining one; deleting the last account creates a fresh default.
    pub async fn delete_account(&self, name: Option<&str>) -> Result<()> {
        let (id, metadata, active_changed) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let id = state.resolve(name)?;
            state.accounts.remove(&id);
            state.comments.remove(&id);
            state.votes.remove(&id);
            state.replies.remove(&id);
            state.comment_cids.retain(|_, (account_id, _)| *account_id != id);
            state.metadata.account_ids.retain(|account_id| *account_id != id);
            state
                .metadata
                .account_names_to_account_ids
                .retain(|_, account_id| *account_id != id);
            let active_changed = state.metadata.active_account_id.as_ref() == Some(&id);
            if active_changed {
                state.metadata.active_account_id = state.metadata.account_ids.first().cloned();
            }
            (id, state.metadata.clone(), active_changed)
        };
        let prefix = format!("{}/", id);
        self.live.stop_prefix(&prefix);
        self.publishing.stop_prefix(&prefix);

        self.database.remove_account(&id).await?;
        self.database.save_metadata(&metadata).await?;
        info!(account_id = %id, "deleted account");
        self.emit(AccountEvent::AccountsChanged);

        match metadata.active_account_id {
            None => {
                self.create_account(None).await?;
            }
            Some(active) if active_changed => {
                self.emit(AccountEvent::ActiveAccountChanged(active));
            }
            Some(_) => {}
        }
        Ok(())
    }

    pub async fn set_active_account(&self, name: &str) -> Result<()> {
        let (id, metadata) = {
            let mut state = self.state.write();
            let id = state.resolve(Some(name))?;
            state.metadata.active_account_id = Some(id.clone());
            (id, state.metadata.clone())
        };
        self.database.save_metadata(&metadata).await?;
        debug!(account_id = %id, "active account changed");
        self.emit(AccountEvent::ActiveAccountChanged(id));
        Ok(())
    }

    /// Replace an account, keeping names unique.
    pub async fn set_account(&self, account: Account) -> Result<()> {
        if account.name.trim().is_empty() {
            return Err(SdkError::InvalidArgument("account name is empty".to_string()));
        }
        let metadata = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let current = state.account_by_id(&account.id)?;
            if current.name != account.name {
                if state.name_taken(&account.name) {
                    return Err(SdkError::DuplicateAccountName(account.name));
                }
                let previous = current.name.clone();
                let names = &mut state.metadata.account_names_to_account_ids;
                names.remove(&previous);
                names.insert(account.name.clone(), account.id.clone());
            }
            state.accounts.insert(account.id.clone(), account.clone());
            state.metadata.clone()
        };
        self.database.save_account(&account).await?;
        self.database.save_metadata(&metadata).await?;
        debug!(account_id = %account.id, "account updated");
        self.emit(AccountEvent::AccountsChanged);
        Ok(())
    }

    /// Reorder the accounts. `names` must be a permutation of the account names.
    pub async fn set_accounts_order(&self, names: &[&str]) -> Result<()> {
        let metadata = {
            let mut state = self.state.write();
            let given: BTreeSet<&str> = names.iter().copied().collect();
            let current: BTreeSet<&str> = state
                .metadata
                .account_names_to_account_ids
                .keys()
                .map(String::as_str)
                .collect();
            if given.len() != names.len() || given != current {
                return Err(SdkError::InvalidArgument(
                    "account order must list every account name exactly once".to_string(),
                ));
            }
            let ids = names
                .iter()
                .map(|name| state.resolve(Some(*name)))
                .collect::<Result<Vec<_>>>()?;
            state.metadata.account_ids = ids;
            state.metadata.clone()
        };
        self.database.save_metadata(&metadata).await?;
        self.emit(AccountEvent::AccountsChanged);
        Ok(())
    }

    /// Import an exported account under a fresh id and a free name.
    pub async fn import_account(self: &Arc<Self>, json: &str) -> Result<Account> {
        let exported: ExportedAccount = serde_json::from_str(json)?;
        let ExportedAccount {
            mut account,
            mut account_comments,
            account_votes,
        } = exported;
        account.id = AccountId::generate();
        account_comments.sort_by_key(|comment| comment.index);
        for (index, comment) in account_comments.iter_mut().enumerate() {
            comment.index = index;
            comment.account_id = account.id.clone();
        }

        let metadata = {
            let mut state = self.state.write();
            account.name = state.unique_name(&account.name);
            state.insert_account(account.clone());
            state
                .comments
                .insert(account.id.clone(), account_comments.clone());
            state.votes.insert(account.id.clone(), account_votes.clone());
            state.index_comments(&account.id);
            state.metadata.clone()
        };
        self.database.save_account(&account).await?;
        for comment in &account_comments {
            self.database.save_account_comment(comment).await?;
        }
        for (index, vote) in account_votes.iter().enumerate() {
            self.database
                .save_account_vote(&account.id, index, vote)
                .await?;
        }
        self.database.save_metadata(&metadata).await?;
        info!(
            account_id = %account.id,
            name = %account.name,
            comments = account_comments.len(),
            votes = account_votes.len(),
            "imported account"
        );

        for comment in &account_comments {
            if let Some(cid) = &comment.cid {
                self.start_comment_updates(&account.id, comment.index, cid);
            }
        }
        self.emit(AccountEvent::AccountsChanged);
        Ok(account)
    }

    /// The account with its comment and vote logs, as JSON.
    pub fn export_account(&self, name: Option<&str>) -> Result<String> {
        let exported = {
            let state = self.state.read();
            let account = state.account(name)?;
            ExportedAccount {
                account: account.clone(),
                account_comments: state.comments.get(&account.id).cloned().unwrap_or_default(),
                account_votes: state.votes.get(&account.id).cloned().unwrap_or_default(),
            }
        };
        Ok(serde_json::to_string_pretty(&exported)?)
    }

    pub async fn subscribe(&self, address: &str, name: Option<&str>) -> Result<()> {
        require_address(address)?;
        self.modify_account(name, |account| {
            if account.is_subscribed(address) {
                return Err(SdkError::InvalidArgument(format!(
                    "already subscribed to {}",
                    address
                )));
            }
            account.subscriptions.push(address.to_string());
            Ok(())
        })
        .await
    }

    pub async fn unsubscribe(&self, address: &str, name: Option<&str>) -> Result<()> {
        require_address(address)?;
        self.modify_account(name, |account| {
            if !account.is_subscribed(address) {
                return Err(SdkError::InvalidArgument(format!(
                    "not subscribed to {}",
                    address
                )));
            }
            account.subscriptions.retain(|s| s != address);
            Ok(())
        })
        .await
    }

    /// Block a subplebbit or author address.
    pub async fn block_address(&self, address: &str, name: Option<&str>) -> Result<()> {
        require_address(address)?;
        self.modify_account(name, |account| {
            if !account.blocked_addresses.insert(address.to_string()) {
                return Err(SdkError::InvalidArgument(format!(
                    "{} is already blocked",
                    address
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn unblock_address(&self, address: &str, name: Option<&str>) -> Result<()> {
        require_address(address)?;
        self.modify_account(name, |account| {
            if !account.blocked_addresses.remove(address) {
                return Err(SdkError::InvalidArgument(format!("{} is not blocked", address)));
            }
            Ok(())
        })
        .await
    }

    async fn modify_account<F>(&self, name: Option<&str>, modify: F) -> Result<()>
    where
        F: FnOnce(&mut Account) -> Result<()>,
    {
        let account = {
            let mut state = self.state.write();
            let id = state.resolve(name)?;
            let account = state
                .accounts
                .get_mut(&id)
                .ok_or_else(|| SdkError::AccountNotFound(id.to_string()))?;
            modify(account)?;
            account.clone()
        };
        self.database.save_account(&account).await?;
        self.emit(AccountEvent::AccountsChanged);
        Ok(())
    }

    /// Subplebbits where the account holds a role, plus the subplebbits the
    /// protocol client runs locally, which count as owned.
    pub async fn account_subplebbits(
        &self,
        name: Option<&str>,
    ) -> Result<BTreeMap<String, AccountSubplebbit>> {
        let derived = self.state.read().account(name)?.subplebbits.clone();
        let owned = self.protocol.list_subplebbits().await?;
        let mut subplebbits: BTreeMap<_, _> = owned
            .into_iter()
            .map(|address| {
                (
                    address,
                    AccountSubplebbit {
                        role: Role::new(RoleKind::Owner),
                    },
                )
            })
            .collect();
        subplebbits.extend(derived);
        Ok(subplebbits)
    }

    /// Give a fetched comment's CID to the unconfirmed log entry it was
    /// published from. Returns whether an entry matched.
    ///
    /// Candidates are the entries without a CID, of accounts whose author
    /// address equals the comment's, with the same timestamp. The first
    /// match wins; it is decided under the write lock, so a comment is
    /// adopted at most once.
    pub async fn add_cid_to_account_comment(self: &Arc<Self>, comment: &Comment) -> Result<bool> {
        if comment.cid.is_empty() {
            return Ok(false);
        }
        let adopted = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            if state.comment_cids.contains_key(&comment.cid) {
                return Ok(false);
            }
            let author = comment.author_address();
            let ids: Vec<AccountId> = state
                .metadata
                .account_ids
                .iter()
                .filter(|id| {
                    state
                        .accounts
                        .get(*id)
                        .is_some_and(|account| account.author.address == author)
                })
                .cloned()
                .collect();

            let mut adopted = None;
            for id in ids {
                let matched = state
                    .comments
                    .get_mut(&id)
                    .and_then(|log| log.iter_mut().find(|entry| entry.matches(comment)));
                if let Some(entry) = matched {
                    entry.adopt(comment);
                    adopted = Some(entry.clone());
                    break;
                }
            }
            let Some(entry) = adopted else {
                return Ok(false);
            };
            state
                .comment_cids
                .insert(comment.cid.clone(), (entry.account_id.clone(), entry.index));
            entry
        };

        self.database.save_account_comment(&adopted).await?;
        info!(
            account_id = %adopted.account_id,
            index = adopted.index,
            cid = %comment.cid,
            "reconciled comment cid"
        );
        self.emit(AccountEvent::CommentsChanged(adopted.account_id.clone()));
        self.start_comment_updates(&adopted.account_id, adopted.index, &comment.cid);
        Ok(true)
    }

    /// Reconcile every comment of `comments` and the replies they carry.
    ///
    /// Failures are logged per comment and do not stop the walk.
    pub async fn reconcile_comments<'a, I>(self: &Arc<Self>, comments: I)
    where
        I: IntoIterator<Item = &'a Comment>,
    {
        for comment in comments {
            for comment in std::iter::once(comment).chain(comment.replies()) {
                if let Err(e) = self.add_cid_to_account_comment(comment).await {
                    warn!(cid = %comment.cid, error = %e, "failed to reconcile comment");
                }
            }
        }
    }

    fn start_comment_updates(self: &Arc<Self>, account_id: &AccountId, index: usize, cid: &str) {
        let store = Arc::clone(self);
        let key = format!("{}/{}", account_id, index);
        let account_id = account_id.clone();
        let cid = cid.to_string();
        self.live.start(&key, move |generation| {
            let mut updates = store.protocol.comment_updates(&cid);
            tokio::spawn(async move {
                while let Some(event) = updates.next().await {
                    if !store.live.is_current(generation) {
                        break;
                    }
                    match event {
                        LiveEvent::Update(update) => {
                            if let Err(e) = store.apply_comment_update(&account_id, index, update).await {
                                warn!(account_id = %account_id, index, error = %e, "failed to apply account comment update");
                            }
                        }
                        LiveEvent::Error(error) => {
                            warn!(account_id = %account_id, cid = %cid, error = %error, "account comment update error");
                        }
                    }
                }
            })
        });
    }

    /// Merge a live update into the log entry and turn its replies into
    /// notifications.
    async fn apply_comment_update(
        &self,
        account_id: &AccountId,
        index: usize,
        update: Comment,
    ) -> Result<()> {
        let (entry, replies) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(author) = state
                .accounts
                .get(account_id)
                .map(|account| account.author.address.clone())
            else {
                return Ok(());
            };
            let Some(entry) = state
                .comments
                .get_mut(account_id)
                .and_then(|log| log.get_mut(index))
            else {
                return Ok(());
            };
            if entry.cid.as_deref() != Some(update.cid.as_str()) {
                return Ok(());
            }
            entry.apply_update(&update);
            let entry = entry.clone();

            let known = state.replies.entry(account_id.clone()).or_default();
            let mut changed = Vec::new();
            for reply in update.replies() {
                if reply.author_address() == author {
                    continue;
                }
                let next = match known.get(&reply.cid) {
                    Some(existing) => AccountCommentReply {
                        comment: existing.comment.merge(reply),
                        marked_as_read: existing.marked_as_read,
                    },
                    None => AccountCommentReply::unread(reply.clone()),
                };
                if known.get(&reply.cid) != Some(&next) {
                    known.insert(reply.cid.clone(), next.clone());
                    changed.push(next);
                }
            }
            (entry, changed)
        };

        self.database.save_account_comment(&entry).await?;
        trace!(account_id = %account_id, index, "account comment updated");
        self.emit(AccountEvent::CommentsChanged(account_id.clone()));

        if !replies.is_empty() {
            for reply in &replies {
                self.database.save_comment_reply(account_id, reply).await?;
            }
            debug!(account_id = %account_id, replies = replies.len(), "notifications updated");
            self.emit(AccountEvent::RepliesChanged(account_id.clone()));
        }
        Ok(())
    }

    /// Mark every current notification as read. Returns how many changed.
    ///
    /// Replies arriving after the call keep their unread flag.
    pub async fn mark_notifications_as_read(&self, name: Option<&str>) -> Result<usize> {
        let (id, read) = {
            let mut state = self.state.write();
            let id = state.resolve(name)?;
            let read: Vec<AccountCommentReply> = state
                .replies
                .entry(id.clone())
                .or_default()
                .values_mut()
                .filter(|reply| !reply.marked_as_read)
                .map(|reply| {
                    reply.marked_as_read = true;
                    reply.clone()
                })
                .collect();
            (id, read)
        };
        if read.is_empty() {
            return Ok(0);
        }
        for reply in &read {
            self.database.save_comment_reply(&id, reply).await?;
        }
        debug!(account_id = %id, read = read.len(), "marked notifications as read");
        self.emit(AccountEvent::RepliesChanged(id));
        Ok(read.len())
    }

    /// Recompute, for every account, whether it holds a role in
    /// `subplebbit`. A subplebbit without a role map grants no roles.
    pub async fn add_subplebbit_role_to_accounts_subplebbits(
        &self,
        subplebbit: &Subplebbit,
    ) -> Result<()> {
        let changed: Vec<Account> = {
            let mut state = self.state.write();
            let address = &subplebbit.address;
            state
                .accounts
                .values_mut()
                .filter_map(|account| {
                    let role = subplebbit.role_of(&account.author.address).cloned();
                    let current = account.subplebbits.get(address).map(|s| &s.role);
                    if current == role.as_ref() {
                        return None;
                    }
                    match role {
                        Some(role) => {
                            account
                                .subplebbits
                                .insert(address.clone(), AccountSubplebbit { role });
                        }
                        None => {
                            account.subplebbits.remove(address);
                        }
                    }
                    Some(account.clone())
                })
                .collect()
        };
        if changed.is_empty() {
            return Ok(());
        }
        for account in &changed {
            self.database.save_account(account).await?;
            debug!(account_id = %account.id, address = %subplebbit.address, "account roles changed");
        }
        self.emit(AccountEvent::AccountsChanged);
        Ok(())
    }

    /// Stop live tracking and publish drivers, then reload from storage.
    pub async fn reset(self: &Arc<Self>) -> Result<()> {
        self.live.stop_all();
        self.publishing.stop_all();
        self.load().await?;
        self.emit(AccountEvent::AccountsChanged);
        Ok(())
    }

    /// Number of running publish drivers.
    pub fn pending_publications(&self) -> usize {
        self.publishing.len()
    }
}

fn require_address(address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(SdkError::InvalidArgument("address is empty".to_string()));
    }
    Ok(())
}
