//! # plebsync-cache
//!
//! Persistent key/value tables for the plebsync store engine.
//!
//! This crate provides:
//! - A [`Storage`] trait over named tables, with an in-memory and a
//!   file-backed implementation
//! - Typed [`Table`] handles (serde in, serde out)
//! - Generational LRU tables ([`LruTable`]) that bound a cache without any
//!   per-key recency bookkeeping
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use plebsync_cache::{CacheRegistry, MemoryStorage};
//!
//! let registry = CacheRegistry::new(Arc::new(MemoryStorage::new()));
//! let comments = registry.create_instance("comments", Some(5000))?;
//!
//! comments.set_item("QmCid", &comment).await?;
//! let cached: Option<Comment> = comments.get_item("QmCid").await?;
//! ```

pub mod error;
pub mod file;
pub mod lru;
pub mod storage;
pub mod table;

pub use error::{CacheError, Result};
pub use file::FileStorage;
pub use lru::{CacheRegistry, LruTable};
pub use storage::{MemoryStorage, Storage};
pub use table::Table;
