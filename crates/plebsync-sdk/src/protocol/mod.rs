//! Protocol client abstractions.
//!
//! The stores never talk to the network directly. Everything they need from
//! the protocol client (fetching entities and pages, creating signers and
//! publications, following live updates) goes through [`Protocol`].

mod memory;

pub use memory::{ChallengePolicy, MemoryProtocol};

use async_trait::async_trait;
use futures::stream::BoxStream;
use plebsync_core::{Author, Cid, Comment, CommentContent, Page, Role, Signer, Subplebbit};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Error reported by the protocol client.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Address resolution failed: {0}")]
    Resolution(String),
    #[error("Network error: {0}")]
    Network(String),
}

pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Anti-spam challenge sent by a subplebbit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub challenge: String,
    /// Media type of the challenge, e.g. `text/plain`.
    pub kind: String,
}

/// Outcome of a submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChallengeVerification {
    pub success: bool,
    /// CID minted for the publication, when the subplebbit reveals it.
    pub publication_cid: Option<Cid>,
    pub reason: Option<String>,
}

/// Events of one submission attempt.
#[derive(Clone, Debug)]
pub enum PublicationEvent {
    Challenge(Challenge),
    ChallengeVerification(ChallengeVerification),
    Error(ProtocolError),
}

/// Events of a live entity subscription.
#[derive(Clone, Debug)]
pub enum LiveEvent<T> {
    Update(T),
    Error(ProtocolError),
}

/// Author and timestamp stamped on a publication by the account store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft<T> {
    pub author: Author,
    pub timestamp: i64,
    #[serde(flatten)]
    pub options: T,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOptions {
    pub comment_cid: Cid,
    pub subplebbit_address: String,
    /// -1, 0 or 1.
    pub vote: i8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentEditOptions {
    pub comment_cid: Cid,
    pub subplebbit_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spoiler: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubplebbitEditOptions {
    pub subplebbit_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<BTreeMap<String, Role>>,
}

/// Options of `Protocol::create_subplebbit`. With an address of an existing
/// subplebbit the remote one is returned; otherwise a new one owned by the
/// signer is created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubplebbitOptions {
    pub address: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// A publication ready to be submitted to its subplebbit.
#[async_trait]
pub trait Publication: Send + Sync {
    /// Submit the publication. Errors before the submission reaches the
    /// subplebbit (e.g. a failed address resolution) are returned directly.
    async fn publish(&self) -> ProtocolResult<BoxStream<'static, PublicationEvent>>;

    /// Answer the challenge of the current submission.
    async fn publish_challenge_answers(&self, answers: Vec<String>) -> ProtocolResult<()>;
}

/// Protocol client collaborator.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    async fn create_signer(&self) -> ProtocolResult<Signer>;

    async fn create_comment(
        &self,
        signer: &Signer,
        content: &CommentContent,
    ) -> ProtocolResult<Arc<dyn Publication>>;

    async fn create_vote(
        &self,
        signer: &Signer,
        vote: &Draft<VoteOptions>,
    ) -> ProtocolResult<Arc<dyn Publication>>;

    async fn create_comment_edit(
        &self,
        signer: &Signer,
        edit: &Draft<CommentEditOptions>,
    ) -> ProtocolResult<Arc<dyn Publication>>;

    async fn create_subplebbit_edit(
        &self,
        signer: &Signer,
        edit: &Draft<SubplebbitEditOptions>,
    ) -> ProtocolResult<Arc<dyn Publication>>;

    async fn create_subplebbit(
        &self,
        signer: &Signer,
        options: &SubplebbitOptions,
    ) -> ProtocolResult<Subplebbit>;

    async fn get_comment(&self, cid: &str) -> ProtocolResult<Comment>;

    async fn get_subplebbit(&self, address: &str) -> ProtocolResult<Subplebbit>;

    async fn get_page(&self, subplebbit_address: &str, page_cid: &str) -> ProtocolResult<Page>;

    /// Addresses of the subplebbits run by this node.
    async fn list_subplebbits(&self) -> ProtocolResult<Vec<String>>;

    /// Follow a comment. The stream starts receiving as soon as this returns.
    fn comment_updates(&self, cid: &str) -> BoxStream<'static, LiveEvent<Comment>>;

    /// Follow a subplebbit. The stream starts receiving as soon as this
    /// returns.
    fn subplebbit_updates(&self, address: &str) -> BoxStream<'static, LiveEvent<Subplebbit>>;
}
