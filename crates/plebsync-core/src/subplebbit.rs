//! Subplebbits: independently updated content collections
//!
//! Addressed by a cryptographic id or a human-readable name. Metadata and the
//! entry points of the post lists are refreshed through live updates.

use crate::merge::{newer_or, Merge};
use crate::page::{EntryPoint, Pages};
use crate::sort::SortType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Owner,
    Admin,
    Moderator,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role: RoleKind,
}

impl Role {
    pub fn new(role: RoleKind) -> Self {
        Self { role }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subplebbit {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<String>>,
    /// Author address -> role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeMap<String, Role>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posts: Option<Pages>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Subplebbit {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Role held by an author address, if any.
    pub fn role_of(&self, author_address: &str) -> Option<&Role> {
        self.roles.as_ref()?.get(author_address)
    }

    /// First page pointer of the post list for `sort_type`.
    pub fn entry_point(&self, sort_type: SortType) -> Option<EntryPoint<'_>> {
        self.posts.as_ref()?.entry_point(sort_type)
    }
}

impl Merge for Subplebbit {
    fn merge(&self, newer: &Self) -> Self {
        Self {
            address: if newer.address.is_empty() {
                self.address.clone()
            } else {
                newer.address.clone()
            },
            title: newer_or(&self.title, &newer.title),
            description: newer_or(&self.description, &newer.description),
            rules: newer_or(&self.rules, &newer.rules),
            roles: newer_or(&self.roles, &newer.roles),
            posts: newer_or(&self.posts, &newer.posts),
            created_at: newer_or(&self.created_at, &newer.created_at),
            updated_at: newer_or(&self.updated_at, &newer.updated_at),
        }
    }
}
