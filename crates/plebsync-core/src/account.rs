//! Local identities and their publications
//!
//! An account is created once, persisted, and only destroyed on explicit
//! deletion. Its comments and votes are kept in append-only logs indexed by
//! position. Until the network confirms a comment it has no CID; the
//! `(author address, timestamp)` pair is then the only correlation key.

use crate::comment::{Author, Cid, Comment, CommentContent, CommentUpdate};
use crate::merge::Merge;
use crate::subplebbit::Role;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use ulid::Ulid;

/// Current serialization version of [`Account`].
pub const ACCOUNT_VERSION: u32 = 1;

/// Opaque, stable account identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    /// Generate a fresh, time-ordered identifier.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Private key material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signer {
    pub private_key: String,
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Connection options handed to the protocol client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolOptions {
    #[serde(default)]
    pub ipfs_gateway_urls: Vec<String>,
    #[serde(default)]
    pub ipfs_http_client_urls: Vec<String>,
    #[serde(default)]
    pub pubsub_http_client_urls: Vec<String>,
    /// Chain ticker -> RPC URL, used for name resolution.
    #[serde(default)]
    pub chain_providers: BTreeMap<String, String>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            ipfs_gateway_urls: vec![
                "https://ipfs.io".to_string(),
                "https://cloudflare-ipfs.com".to_string(),
            ],
            ipfs_http_client_urls: Vec::new(),
            pubsub_http_client_urls: vec!["https://pubsubprovider.xyz/api/v0".to_string()],
            chain_providers: BTreeMap::from([(
                "eth".to_string(),
                "https://ethrpc.xyz".to_string(),
            )]),
        }
    }
}

/// A subplebbit where the account holds a role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSubplebbit {
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub author: Author,
    pub signer: Signer,
    /// Subscribed subplebbit addresses, in subscription order.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Blocked subplebbit and author addresses.
    #[serde(default)]
    pub blocked_addresses: BTreeSet<String>,
    /// Derived from subplebbit role maps, never edited directly.
    #[serde(default)]
    pub subplebbits: BTreeMap<String, AccountSubplebbit>,
    #[serde(default)]
    pub protocol_options: ProtocolOptions,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    ACCOUNT_VERSION
}

impl Account {
    /// New account authored by the signer's address.
    pub fn new(name: impl Into<String>, signer: Signer) -> Self {
        Self {
            id: AccountId::generate(),
            name: name.into(),
            author: Author::new(signer.address.clone()),
            signer,
            subscriptions: Vec::new(),
            blocked_addresses: BTreeSet::new(),
            subplebbits: BTreeMap::new(),
            protocol_options: ProtocolOptions::default(),
            version: ACCOUNT_VERSION,
        }
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked_addresses.contains(address)
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.subscriptions.iter().any(|s| s == address)
    }
}

/// A comment in an account's publication log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountComment {
    /// Position in the account's log.
    pub index: usize,
    pub account_id: AccountId,
    /// Assigned once the network confirms the comment, immutable afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<Cid>,
    #[serde(flatten)]
    pub content: CommentContent,
    #[serde(flatten)]
    pub update: CommentUpdate,
}

impl AccountComment {
    pub fn new(index: usize, account_id: AccountId, content: CommentContent) -> Self {
        Self {
            index,
            account_id,
            cid: None,
            content,
            update: CommentUpdate::default(),
        }
    }

    /// Whether a fetched comment is this unconfirmed publication.
    ///
    /// Author address and timestamp are compared; there is no stronger link
    /// between a draft and its network copy until a CID is assigned.
    pub fn matches(&self, comment: &Comment) -> bool {
        self.cid.is_none()
            && self.content.timestamp == comment.content.timestamp
            && self.content.author.address == comment.content.author.address
    }

    /// Adopt the network copy: take its CID, fill missing fields, keep ours.
    pub fn adopt(&mut self, comment: &Comment) {
        self.cid = Some(comment.cid.clone());
        self.content = self.content.fill_missing(&comment.content);
        self.update = self.update.fill_missing(&comment.update);
    }

    /// Apply a live update of the confirmed comment.
    pub fn apply_update(&mut self, comment: &Comment) {
        self.update.merge_assign(&comment.update);
    }

    /// The log entry as a network comment, once it has a CID.
    pub fn to_comment(&self) -> Option<Comment> {
        Some(Comment {
            cid: self.cid.clone()?,
            content: self.content.clone(),
            update: self.update.clone(),
        })
    }
}

/// A vote in an account's publication log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountVote {
    pub comment_cid: Cid,
    /// -1, 0 (retracted) or 1.
    pub vote: i8,
    pub timestamp: i64,
    pub subplebbit_address: String,
}

/// A reply to one of the account's comments, shown as a notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCommentReply {
    #[serde(flatten)]
    pub comment: Comment,
    #[serde(default)]
    pub marked_as_read: bool,
}

impl AccountCommentReply {
    pub fn unread(comment: Comment) -> Self {
        Self {
            comment,
            marked_as_read: false,
        }
    }
}
