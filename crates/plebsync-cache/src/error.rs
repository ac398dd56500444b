//! Error types for the cache layer.

use thiserror::Error;

/// Errors that can occur in cache and storage operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache instance '{0}' already created with a size")]
    AlreadyCreated(String),

    #[error("Cache instance '{0}' not created, a size is required")]
    NotCreated(String),

    #[error("Invalid cache size for '{name}': {size}")]
    InvalidSize { name: String, size: usize },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
