//! Comments: content-addressed posts and replies
//!
//! A comment is split in two halves:
//!  - `CommentContent`: what the author signed and published. Immutable once
//!    the comment has a CID.
//!  - `CommentUpdate`: facets maintained by the subplebbit (votes, moderation
//!    flags, reply pages). These arrive through live updates and are merged.

use crate::merge::{newer_or, Merge};
use crate::page::Pages;
use serde::{Deserialize, Serialize};

/// Content identifier. Immutable once assigned.
pub type Cid = String;

/// Public identity of a comment author.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Author {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }
}

/// The published, signed part of a comment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentContent {
    pub subplebbit_address: String,
    pub author: Author,
    /// Seconds since the Unix epoch, stamped at publish time.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_cid: Option<Cid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_cid: Option<Cid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

impl Merge for CommentContent {
    fn merge(&self, newer: &Self) -> Self {
        let pick = |older: &String, newer: &String| {
            if newer.is_empty() {
                older.clone()
            } else {
                newer.clone()
            }
        };

        Self {
            subplebbit_address: pick(&self.subplebbit_address, &newer.subplebbit_address),
            author: Author {
                address: pick(&self.author.address, &newer.author.address),
                display_name: newer_or(&self.author.display_name, &newer.author.display_name),
            },
            timestamp: if newer.timestamp != 0 {
                newer.timestamp
            } else {
                self.timestamp
            },
            title: newer_or(&self.title, &newer.title),
            content: newer_or(&self.content, &newer.content),
            link: newer_or(&self.link, &newer.link),
            parent_cid: newer_or(&self.parent_cid, &newer.parent_cid),
            post_cid: newer_or(&self.post_cid, &newer.post_cid),
            depth: newer_or(&self.depth, &newer.depth),
        }
    }
}

/// Mutable facets of a comment, maintained by its subplebbit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upvote_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downvote_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spoiler: Option<bool>,
    /// Content replaced by an author edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Pages>,
}

impl Merge for CommentUpdate {
    fn merge(&self, newer: &Self) -> Self {
        Self {
            upvote_count: newer_or(&self.upvote_count, &newer.upvote_count),
            downvote_count: newer_or(&self.downvote_count, &newer.downvote_count),
            reply_count: newer_or(&self.reply_count, &newer.reply_count),
            updated_at: newer_or(&self.updated_at, &newer.updated_at),
            last_reply_timestamp: newer_or(&self.last_reply_timestamp, &newer.last_reply_timestamp),
            pinned: newer_or(&self.pinned, &newer.pinned),
            removed: newer_or(&self.removed, &newer.removed),
            locked: newer_or(&self.locked, &newer.locked),
            deleted: newer_or(&self.deleted, &newer.deleted),
            spoiler: newer_or(&self.spoiler, &newer.spoiler),
            edited_content: newer_or(&self.edited_content, &newer.edited_content),
            replies: newer_or(&self.replies, &newer.replies),
        }
    }
}

/// A published comment as seen on the network.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub cid: Cid,
    #[serde(flatten)]
    pub content: CommentContent,
    #[serde(flatten)]
    pub update: CommentUpdate,
}

impl Comment {
    pub fn new(cid: impl Into<Cid>, content: CommentContent) -> Self {
        Self {
            cid: cid.into(),
            content,
            update: CommentUpdate::default(),
        }
    }

    pub fn author_address(&self) -> &str {
        &self.content.author.address
    }

    pub fn subplebbit_address(&self) -> &str {
        &self.content.subplebbit_address
    }

    pub fn timestamp(&self) -> i64 {
        self.content.timestamp
    }

    pub fn upvotes(&self) -> u64 {
        self.update.upvote_count.unwrap_or(0)
    }

    pub fn downvotes(&self) -> u64 {
        self.update.downvote_count.unwrap_or(0)
    }

    /// Upvotes minus downvotes, clamped to the `i64` range.
    pub fn score(&self) -> i64 {
        let score = i128::from(self.upvotes()) - i128::from(self.downvotes());
        score.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    /// Every reply carried in this comment's reply pages, deduplicated by cid.
    pub fn replies(&self) -> Vec<&Comment> {
        self.update
            .replies
            .as_ref()
            .map(|pages| pages.inline_comments())
            .unwrap_or_default()
    }
}

impl Merge for Comment {
    fn merge(&self, newer: &Self) -> Self {
        Self {
            cid: if newer.cid.is_empty() {
                self.cid.clone()
            } else {
                newer.cid.clone()
            },
            content: self.content.merge(&newer.content),
            update: self.update.merge(&newer.update),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use crate::sort::SortType;

    fn content(timestamp: i64) -> CommentContent {
        CommentContent {
            subplebbit_address: "news.eth".to_string(),
            author: Author::new("12D3KooWAuthor"),
            timestamp,
            content: Some("hello".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_partial_update_keeps_known_fields() {
        let mut comment = Comment::new("QmA", content(100));
        comment.update.upvote_count = Some(3);
        comment.update.reply_count = Some(7);

        let partial = Comment {
            cid: "QmA".to_string(),
            content: CommentContent::default(),
            update: CommentUpdate {
                upvote_count: Some(4),
                ..Default::default()
            },
        };

        let merged = comment.merge(&partial);
        assert_eq!(merged.update.upvote_count, Some(4));
        assert_eq!(merged.update.reply_count, Some(7));
        assert_eq!(merged.content, comment.content);
    }

    #[test]
    fn test_score() {
        let mut comment = Comment::new("QmA", content(1));
        comment.update.upvote_count = Some(2);
        comment.update.downvote_count = Some(5);
        assert_eq!(comment.score(), -3);

        comment.update.upvote_count = Some(u64::MAX);
        comment.update.downvote_count = Some(0);
        assert_eq!(comment.score(), i64::MAX);
        comment.update.upvote_count = Some(0);
        comment.update.downvote_count = Some(u64::MAX);
        assert_eq!(comment.score(), i64::MIN);
    }

    #[test]
    fn test_replies_deduplicated_across_sorts() {
        let reply = Comment::new("QmReply", content(2));
        let mut comment = Comment::new("QmA", content(1));
        let mut pages = Pages::default();
        pages.pages.insert(SortType::TopAll, Page::new(vec![reply.clone()], None));
        pages.pages.insert(SortType::New, Page::new(vec![reply], None));
        comment.update.replies = Some(pages);

        assert_eq!(comment.replies().len(), 1);
    }

    #[test]
    fn test_serde_flattened_camel_case() {
        let mut comment = Comment::new("QmA", content(42));
        comment.update.upvote_count = Some(1);

        let json = serde_json::to_value(&comment).unwrap();
        assert_eq!(json["cid"], "QmA");
        assert_eq!(json["subplebbitAddress"], "news.eth");
        assert_eq!(json["upvoteCount"], 1);
        assert!(json.get("downvoteCount").is_none());

        let back: Comment = serde_json::from_value(json).unwrap();
        assert_eq!(back, comment);
    }
}
