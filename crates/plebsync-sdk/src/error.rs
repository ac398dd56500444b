//! Error types for the plebsync SDK.

use crate::protocol::ProtocolError;
use plebsync_cache::CacheError;
use thiserror::Error;

/// Errors raised by store operations.
#[derive(Error, Debug)]
pub enum SdkError {
    /// Malformed arguments. A caller bug, never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account name already exists: {0}")]
    DuplicateAccountName(String),

    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    /// The current page of a feed is not fully loaded yet.
    #[error("Feed {feed} has not loaded page {page_number} yet")]
    PageNotLoaded { feed: String, page_number: usize },

    /// A publication was refused before any challenge was issued.
    #[error("Publication rejected: {0}")]
    PublishRejected(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
