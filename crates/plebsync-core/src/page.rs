//! Pages of comments
//!
//! A subplebbit publishes its posts, per sort type, as a singly linked list of
//! pages. The first page is either preloaded inline in the subplebbit (or
//! comment, for replies) or referenced by a bare page CID:
//!
//! ```text
//! posts.pages[hot]     = Page { comments, next_cid: Some(c2) }   (inline)
//! posts.page_cids[hot] = c1                                      (pointer)
//!
//! [first] --next_cid--> [c2] --next_cid--> [c3] --None
//! ```

use crate::comment::{Cid, Comment};
use crate::sort::SortType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fetched batch of comments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cid: Option<Cid>,
}

impl Page {
    pub fn new(comments: Vec<Comment>, next_cid: Option<Cid>) -> Self {
        Self { comments, next_cid }
    }

    /// Whether this page terminates its list.
    pub fn is_last(&self) -> bool {
        self.next_cid.is_none()
    }
}

/// Per-sort entry points of a paginated list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pages {
    #[serde(default)]
    pub pages: BTreeMap<SortType, Page>,
    #[serde(default)]
    pub page_cids: BTreeMap<SortType, Cid>,
}

/// Where the list of pages for one sort type starts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EntryPoint<'a> {
    /// First page preloaded inline.
    Inline(&'a Page),
    /// First page must be fetched.
    Cid(&'a Cid),
}

impl Pages {
    /// Inline page data takes priority over a bare pointer.
    pub fn entry_point(&self, sort_type: SortType) -> Option<EntryPoint<'_>> {
        if let Some(page) = self.pages.get(&sort_type) {
            return Some(EntryPoint::Inline(page));
        }
        self.page_cids.get(&sort_type).map(EntryPoint::Cid)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty() && self.page_cids.is_empty()
    }

    /// Comments of every inline page, deduplicated by cid across sort types.
    pub fn inline_comments(&self) -> Vec<&Comment> {
        let mut seen = std::collections::HashSet::new();
        self.pages
            .values()
            .flat_map(|page| page.comments.iter())
            .filter(|comment| seen.insert(comment.cid.as_str()))
            .collect()
    }
}
