//! plebsync SDK - Stores and feeds for a content-addressed discussion network
//!
//! This SDK keeps a local, incrementally updated view of remote comments and
//! subplebbits, the accounts that publish into them, and the feeds that merge
//! them for reading.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plebsync_cache::MemoryStorage;
//! use plebsync_sdk::prelude::*;
//!
//! let client = Client::open(
//!     Arc::new(MemoryProtocol::new()),
//!     Arc::new(MemoryStorage::new()),
//!     ClientConfig::default(),
//! )
//! .await?;
//!
//! // Publish with the active account
//! let handle = client
//!     .accounts()
//!     .publish_comment(
//!         CommentOptions {
//!             subplebbit_address: "news.eth".to_string(),
//!             content: Some("hello".to_string()),
//!             ..Default::default()
//!         },
//!         None,
//!         PublishCallbacks::new(),
//!     )
//!     .await?;
//! let state = handle.wait_settled().await;
//!
//! // Read a feed
//! let account = client.accounts().active_account()?;
//! let key = client
//!     .feeds()
//!     .add_feed_to_store(&account, ["news.eth"], SortType::New, false)?;
//! let posts = client.feeds().feed(&key).map(|feed| feed.loaded);
//! ```
//!
//! # Architecture
//!
//! - [`client`] - Composition root and the bridges between stores
//! - [`accounts`] - Identities, publication logs, publishing, notifications
//! - [`comments`] - Live comment snapshots
//! - [`subplebbits`] - Live subplebbit snapshots
//! - [`pages`] - Linked post pages per subplebbit and sort type
//! - [`feeds`] - Sorted, buffered, paged multi-subplebbit feeds
//! - [`protocol`] - The network client boundary and an in-memory implementation
//! - [`config`] - Client configuration
//! - [`error`] - Error types

pub mod accounts;
pub mod client;
pub mod comments;
pub mod config;
pub mod error;
pub mod feeds;
mod guard;
pub mod pages;
pub mod protocol;
pub mod subplebbits;

// Re-exports for convenience
pub use accounts::{
    AccountEvent, AccountsStore, ChallengeAnswerer, CommentOptions, ExportedAccount,
    PublishCallbacks, PublishHandle, PublishState,
};
pub use client::Client;
pub use comments::{CommentEvent, CommentsStore};
pub use config::{ClientConfig, ClientConfigBuilder, RetryPolicy};
pub use error::{Result, SdkError};
pub use feeds::{FeedEvent, FeedKey, FeedSnapshot, FeedsStore};
pub use pages::{PageAdded, PagesStore};
pub use protocol::{
    Challenge, ChallengePolicy, ChallengeVerification, CommentEditOptions, LiveEvent,
    MemoryProtocol, Protocol, ProtocolError, Publication, PublicationEvent,
    SubplebbitEditOptions, SubplebbitOptions, VoteOptions,
};
pub use subplebbits::{SubplebbitEvent, SubplebbitsStore};

// Re-export the data model
pub use plebsync_core::{
    Account, AccountComment, AccountCommentReply, AccountId, Author, Cid, Comment, Page, Role,
    RoleKind, SortType, Subplebbit,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::accounts::{CommentOptions, PublishCallbacks, PublishState};
    pub use crate::client::Client;
    pub use crate::config::ClientConfig;
    pub use crate::error::SdkError;
    pub use crate::feeds::FeedKey;
    pub use crate::protocol::{MemoryProtocol, Protocol};
    pub use plebsync_core::SortType;
}
