//! Feed aggregator.
//!
//! A feed merges the post pages of several subplebbits into one sorted list
//! for an account. Each feed keeps two disjoint pools:
//!
//! - `loaded`: what the reader has been shown; only ever grows, in order.
//! - `buffered`: everything else reachable right now, sorted, recomputed from
//!   scratch on every upstream change.
//!
//! Recomputation is debounced to at most once per `feeds_update_interval`.
//! When the buffered posts of a member subplebbit run low, its next page is
//! fetched so the buffer refills before the reader reaches the end.

use crate::accounts::AccountsStore;
use crate::config::ClientConfig;
use crate::error::{Result, SdkError};
use crate::guard::LiveSubscriptions;
use crate::pages::PagesStore;
use crate::subplebbits::SubplebbitsStore;
use parking_lot::RwLock;
use plebsync_core::sort::sort_comments;
use plebsync_core::{Account, AccountId, Cid, Comment, Page, SortType, Subplebbit};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const UPDATE_TASK: &str = "update";

/// Identity of a feed. Member addresses are kept sorted and deduplicated, so
/// the same set of subplebbits always yields the same key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey {
    pub account_id: AccountId,
    pub sort_type: SortType,
    pub subplebbit_addresses: Vec<String>,
}

impl FeedKey {
    pub fn new<I, S>(account_id: AccountId, sort_type: SortType, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut subplebbit_addresses: Vec<String> = addresses.into_iter().map(Into::into).collect();
        subplebbit_addresses.sort();
        subplebbit_addresses.dedup();
        Self {
            account_id,
            sort_type,
            subplebbit_addresses,
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_id,
            self.sort_type,
            self.subplebbit_addresses.join(",")
        )
    }
}

#[derive(Default)]
struct FeedState {
    page_number: usize,
    loaded: Vec<Arc<Comment>>,
    loaded_cids: HashSet<Cid>,
    buffered: Vec<Arc<Comment>>,
    post_counts: BTreeMap<String, usize>,
    has_more: bool,
}

/// Point-in-time view of a feed.
#[derive(Clone, Debug)]
pub struct FeedSnapshot {
    pub key: FeedKey,
    pub loaded: Vec<Arc<Comment>>,
    pub buffered_len: usize,
    pub has_more: bool,
    pub page_number: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent {
    Updated(FeedKey),
}

/// A member subplebbit as seen by one recomputation.
struct Member {
    address: String,
    subplebbit: Option<Arc<Subplebbit>>,
    pages: Vec<Arc<Page>>,
}

impl Member {
    /// Not loaded yet, no page fetched yet, or the tail links further.
    fn has_more(&self, sort_type: SortType) -> bool {
        let Some(subplebbit) = &self.subplebbit else {
            return true;
        };
        if subplebbit.entry_point(sort_type).is_none() {
            return false;
        }
        match self.pages.last() {
            None => true,
            Some(tail) => tail.next_cid.is_some(),
        }
    }
}

struct PageRequest {
    account: Account,
    subplebbit: Arc<Subplebbit>,
    sort_type: SortType,
}

pub struct FeedsStore {
    accounts: Arc<AccountsStore>,
    subplebbits: Arc<SubplebbitsStore>,
    pages: Arc<PagesStore>,
    config: ClientConfig,
    feeds: RwLock<BTreeMap<FeedKey, FeedState>>,
    /// The pending debounced recomputation.
    scheduled: LiveSubscriptions,
    event_tx: broadcast::Sender<FeedEvent>,
}

impl FeedsStore {
    pub fn new(
        accounts: Arc<AccountsStore>,
        subplebbits: Arc<SubplebbitsStore>,
        pages: Arc<PagesStore>,
        config: &ClientConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            accounts,
            subplebbits,
            pages,
            config: config.clone(),
            feeds: RwLock::new(BTreeMap::new()),
            scheduled: LiveSubscriptions::new(),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.event_tx.subscribe()
    }

    pub fn feed_keys(&self) -> Vec<FeedKey> {
        self.feeds.read().keys().cloned().collect()
    }

    /// Register a feed and start loading its subplebbits.
    ///
    /// A buffered-only feed starts at page 0 and never loads posts until its
    /// page number is incremented.
    pub fn add_feed_to_store<I, S>(
        self: &Arc<Self>,
        account: &Account,
        addresses: I,
        sort_type: SortType,
        buffered_only: bool,
    ) -> Result<FeedKey>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = FeedKey::new(account.id.clone(), sort_type, addresses);
        if key.subplebbit_addresses.is_empty() {
            return Err(SdkError::InvalidArgument(
                "feed has no subplebbit addresses".to_string(),
            ));
        }
        if key.subplebbit_addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(SdkError::InvalidArgument(
                "feed has an empty subplebbit address".to_string(),
            ));
        }

        {
            let mut feeds = self.feeds.write();
            if feeds.contains_key(&key) {
                return Ok(key);
            }
            feeds.insert(
                key.clone(),
                FeedState {
                    page_number: if buffered_only { 0 } else { 1 },
                    has_more: true,
                    ..Default::default()
                },
            );
        }
        debug!(feed = %key, buffered_only, "added feed");

        for address in &key.subplebbit_addresses {
            let store = Arc::clone(self);
            let account = account.clone();
            let address = address.clone();
            tokio::spawn(async move {
                match store
                    .subplebbits
                    .add_subplebbit_to_store(&address, &account)
                    .await
                {
                    Ok(()) => store.schedule_update(),
                    Err(e) => warn!(address = %address, error = %e, "failed to load feed subplebbit"),
                }
            });
        }
        self.schedule_update();
        Ok(key)
    }

    /// Show one more page. Fails while the current page is not fully loaded.
    pub fn increment_page_number(self: &Arc<Self>, key: &FeedKey) -> Result<()> {
        let page_number = {
            let mut feeds = self.feeds.write();
            let feed = feeds
                .get_mut(key)
                .ok_or_else(|| SdkError::FeedNotFound(key.to_string()))?;
            if feed.page_number * self.config.posts_per_page > feed.loaded.len() {
                return Err(SdkError::PageNotLoaded {
                    feed: key.to_string(),
                    page_number: feed.page_number,
                });
            }
            feed.page_number += 1;
            feed.page_number
        };
        debug!(feed = %key, page_number, "incremented page number");
        self.schedule_update();
        Ok(())
    }

    /// Unregister a feed. Returns whether it existed.
    pub fn remove_feed_from_store(&self, key: &FeedKey) -> bool {
        self.feeds.write().remove(key).is_some()
    }

    pub fn feed(&self, key: &FeedKey) -> Option<FeedSnapshot> {
        self.feeds.read().get(key).map(|feed| FeedSnapshot {
            key: key.clone(),
            loaded: feed.loaded.clone(),
            buffered_len: feed.buffered.len(),
            has_more: feed.has_more,
            page_number: feed.page_number,
        })
    }

    pub fn buffered_feed(&self, key: &FeedKey) -> Option<Vec<Arc<Comment>>> {
        self.feeds.read().get(key).map(|feed| feed.buffered.clone())
    }

    /// Buffered posts per member subplebbit.
    pub fn subplebbit_post_counts(&self, key: &FeedKey) -> Option<BTreeMap<String, usize>> {
        self.feeds.read().get(key).map(|feed| feed.post_counts.clone())
    }

    /// Recompute every feed after `feeds_update_interval`, unless a
    /// recomputation is already scheduled.
    pub fn schedule_update(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let interval = self.config.feeds_update_interval;
        self.scheduled.start(UPDATE_TASK, move |generation| {
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                store.scheduled.remove(UPDATE_TASK);
                if store.scheduled.is_current(generation) {
                    store.update_feeds();
                }
            })
        });
    }

    /// Recompute every feed now, then request the pages that run low.
    pub fn update_feeds(self: &Arc<Self>) {
        let keys = self.feed_keys();
        let inputs: Vec<(FeedKey, Account, Vec<Member>)> = keys
            .into_iter()
            .filter_map(|key| {
                let account = self.accounts.account_by_id(&key.account_id)?;
                let members = self.members(&key, &account);
                Some((key, account, members))
            })
            .collect();

        let mut changed = Vec::new();
        let mut requests = Vec::new();
        {
            let mut feeds = self.feeds.write();
            for (key, account, members) in inputs {
                let Some(feed) = feeds.get_mut(&key) else {
                    continue;
                };
                if self.recompute(&key, feed, &account, &members) {
                    changed.push(key.clone());
                }
                for member in members {
                    let Some(subplebbit) = member.subplebbit else {
                        continue;
                    };
                    let buffered = feed.post_counts.get(&member.address).copied().unwrap_or(0);
                    let has_next = match member.pages.last() {
                        Some(tail) => tail.next_cid.is_some(),
                        None => self.pages.has_next_page(&subplebbit, key.sort_type),
                    };
                    if buffered <= self.config.posts_left_before_next_page && has_next {
                        requests.push(PageRequest {
                            account: account.clone(),
                            subplebbit,
                            sort_type: key.sort_type,
                        });
                    }
                }
            }
        }

        for key in changed {
            let _ = self.event_tx.send(FeedEvent::Updated(key));
        }
        for request in requests {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                let PageRequest {
                    account,
                    subplebbit,
                    sort_type,
                } = request;
                match store
                    .pages
                    .add_next_page_to_store(&subplebbit, sort_type, &account)
                    .await
                {
                    Ok(()) => store.schedule_update(),
                    Err(e) => warn!(
                        address = %subplebbit.address,
                        sort_type = %sort_type,
                        error = %e,
                        "failed to fetch feed page"
                    ),
                }
            });
        }
    }

    /// Members not blocked by the feed's account, with their current pages.
    fn members(&self, key: &FeedKey, account: &Account) -> Vec<Member> {
        key.subplebbit_addresses
            .iter()
            .filter(|address| !account.is_blocked(address))
            .map(|address| {
                let subplebbit = self.subplebbits.get(address);
                let pages = subplebbit
                    .as_ref()
                    .map(|s| self.pages.subplebbit_pages(s, key.sort_type))
                    .unwrap_or_default();
                Member {
                    address: address.clone(),
                    subplebbit,
                    pages,
                }
            })
            .collect()
    }

    /// Rebuild `buffered` and top up `loaded`. Returns whether anything a
    /// reader can see changed.
    fn recompute(
        &self,
        key: &FeedKey,
        feed: &mut FeedState,
        account: &Account,
        members: &[Member],
    ) -> bool {
        let mut seen = HashSet::new();
        let mut buffered: Vec<Arc<Comment>> = members
            .iter()
            .flat_map(|member| member.pages.iter())
            .flat_map(|page| page.comments.iter())
            .filter(|comment| !feed.loaded_cids.contains(&comment.cid))
            .filter(|comment| {
                !account.is_blocked(comment.author_address())
                    && !account.is_blocked(comment.subplebbit_address())
            })
            .filter(|comment| seen.insert(comment.cid.clone()))
            .map(|comment| Arc::new(comment.clone()))
            .collect();
        sort_comments(&mut buffered, key.sort_type);

        let wanted = feed.page_number * self.config.posts_per_page;
        let take = wanted.saturating_sub(feed.loaded.len()).min(buffered.len());
        let loaded_before = feed.loaded.len();
        for comment in buffered.drain(..take) {
            feed.loaded_cids.insert(comment.cid.clone());
            feed.loaded.push(comment);
        }

        let mut post_counts: BTreeMap<String, usize> = members
            .iter()
            .map(|member| (member.address.clone(), 0))
            .collect();
        for comment in &buffered {
            if let Some(count) = post_counts.get_mut(comment.subplebbit_address()) {
                *count += 1;
            }
        }
        let has_more =
            !buffered.is_empty() || members.iter().any(|member| member.has_more(key.sort_type));

        let changed = feed.loaded.len() != loaded_before
            || feed.has_more != has_more
            || feed.post_counts != post_counts
            || !same_cids(&feed.buffered, &buffered);
        trace!(
            feed = %key,
            loaded = feed.loaded.len(),
            buffered = buffered.len(),
            has_more,
            "recomputed feed"
        );
        feed.buffered = buffered;
        feed.post_counts = post_counts;
        feed.has_more = has_more;
        changed
    }

    pub fn reset(&self) {
        self.scheduled.stop_all();
        self.feeds.write().clear();
    }
}

fn same_cids(a: &[Arc<Comment>], b: &[Arc<Comment>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.cid == y.cid)
}
