//! Durable layout of the account store.
//!
//! | table                     | key                        | value                  |
//! |---------------------------|----------------------------|------------------------|
//! | `accounts`                | account id                 | `Account`              |
//! | `accountsMetadata`        | `accountIds`               | ordered ids            |
//! |                           | `activeAccountId`          | id                     |
//! |                           | `accountNamesToAccountIds` | name -> id             |
//! | `comments-{id}`           | log index                  | `AccountComment`       |
//! | `votes-{id}`              | log index                  | `AccountVote`          |
//! | `commentReplies-{id}` LRU | reply cid                  | `AccountCommentReply`  |

use crate::error::Result;
use plebsync_cache::{CacheRegistry, LruTable, Table};
use plebsync_core::{Account, AccountComment, AccountCommentReply, AccountId, AccountVote};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

const ACCOUNTS_TABLE: &str = "accounts";
const METADATA_TABLE: &str = "accountsMetadata";
const ACCOUNT_IDS: &str = "accountIds";
const ACTIVE_ACCOUNT_ID: &str = "activeAccountId";
const ACCOUNT_NAMES: &str = "accountNamesToAccountIds";

/// Ordering and naming of the accounts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AccountsMetadata {
    pub account_ids: Vec<AccountId>,
    pub active_account_id: Option<AccountId>,
    pub account_names_to_account_ids: BTreeMap<String, AccountId>,
}

pub(crate) struct AccountsDatabase {
    caches: Arc<CacheRegistry>,
    accounts: Table,
    metadata: Table,
    replies_cache_size: usize,
}

impl AccountsDatabase {
    pub fn new(caches: Arc<CacheRegistry>, replies_cache_size: usize) -> Self {
        Self {
            accounts: caches.table(ACCOUNTS_TABLE),
            metadata: caches.table(METADATA_TABLE),
            caches,
            replies_cache_size,
        }
    }

    fn comments_table(&self, account_id: &AccountId) -> Table {
        self.caches.table(&format!("comments-{}", account_id))
    }

    fn votes_table(&self, account_id: &AccountId) -> Table {
        self.caches.table(&format!("votes-{}", account_id))
    }

    fn replies_cache(&self, account_id: &AccountId) -> Result<LruTable> {
        Ok(self.caches.get_or_create(
            &format!("commentReplies-{}", account_id),
            self.replies_cache_size,
        )?)
    }

    pub async fn metadata(&self) -> Result<AccountsMetadata> {
        Ok(AccountsMetadata {
            account_ids: self.metadata.get_item(ACCOUNT_IDS).await?.unwrap_or_default(),
            active_account_id: self.metadata.get_item(ACTIVE_ACCOUNT_ID).await?,
            account_names_to_account_ids: self
                .metadata
                .get_item(ACCOUNT_NAMES)
                .await?
                .unwrap_or_default(),
        })
    }

    pub async fn save_metadata(&self, metadata: &AccountsMetadata) -> Result<()> {
        self.metadata
            .set_item(ACCOUNT_IDS, &metadata.account_ids)
            .await?;
        match &metadata.active_account_id {
            Some(id) => self.metadata.set_item(ACTIVE_ACCOUNT_ID, id).await?,
            None => self.metadata.remove_item(ACTIVE_ACCOUNT_ID).await?,
        }
        self.metadata
            .set_item(ACCOUNT_NAMES, &metadata.account_names_to_account_ids)
            .await?;
        Ok(())
    }

    pub async fn account(&self, account_id: &AccountId) -> Result<Option<Account>> {
        Ok(self.accounts.get_item(account_id.as_str()).await?)
    }

    pub async fn save_account(&self, account: &Account) -> Result<()> {
        Ok(self.accounts.set_item(account.id.as_str(), account).await?)
    }

    /// Remove an account together with its logs and notifications.
    pub async fn remove_account(&self, account_id: &AccountId) -> Result<()> {
        self.accounts.remove_item(account_id.as_str()).await?;
        self.comments_table(account_id).clear().await?;
        self.votes_table(account_id).clear().await?;
        self.replies_cache(account_id)?.clear().await?;
        Ok(())
    }

    pub async fn account_comments(&self, account_id: &AccountId) -> Result<Vec<AccountComment>> {
        indexed_log(&self.comments_table(account_id)).await
    }

    /// Write a comment at its log index, appending or overwriting in place.
    pub async fn save_account_comment(&self, comment: &AccountComment) -> Result<()> {
        Ok(self
            .comments_table(&comment.account_id)
            .set_item(&comment.index.to_string(), comment)
            .await?)
    }

    pub async fn account_votes(&self, account_id: &AccountId) -> Result<Vec<AccountVote>> {
        indexed_log(&self.votes_table(account_id)).await
    }

    pub async fn save_account_vote(
        &self,
        account_id: &AccountId,
        index: usize,
        vote: &AccountVote,
    ) -> Result<()> {
        Ok(self
            .votes_table(account_id)
            .set_item(&index.to_string(), vote)
            .await?)
    }

    pub async fn comment_replies(&self, account_id: &AccountId) -> Result<Vec<AccountCommentReply>> {
        let entries = self
            .replies_cache(account_id)?
            .entries::<AccountCommentReply>()
            .await?;
        Ok(entries.into_iter().map(|(_, reply)| reply).collect())
    }

    pub async fn save_comment_reply(
        &self,
        account_id: &AccountId,
        reply: &AccountCommentReply,
    ) -> Result<()> {
        Ok(self
            .replies_cache(account_id)?
            .set_item(&reply.comment.cid, reply)
            .await?)
    }
}

/// Entries of a table keyed by log index, in index order.
async fn indexed_log<T: DeserializeOwned>(table: &Table) -> Result<Vec<T>> {
    let mut entries: Vec<(usize, T)> = table
        .entries::<T>()
        .await?
        .into_iter()
        .filter_map(|(key, value)| key.parse().ok().map(|index| (index, value)))
        .collect();
    entries.sort_by_key(|(index, _)| *index);
    Ok(entries.into_iter().map(|(_, value)| value).collect())
}
