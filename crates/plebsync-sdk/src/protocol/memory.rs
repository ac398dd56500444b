//! In-memory protocol client for tests and simulations.

use super::{
    Challenge, ChallengeVerification, CommentEditOptions, Draft, LiveEvent, Protocol,
    ProtocolError, ProtocolResult, Publication, PublicationEvent, SubplebbitEditOptions,
    SubplebbitOptions, VoteOptions,
};
use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use plebsync_core::{Cid, Comment, CommentContent, Page, Role, RoleKind, Signer, Subplebbit};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;
use ulid::Ulid;

/// How the simulated subplebbits treat publications.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ChallengePolicy {
    /// Accept without a challenge and reveal the minted CID.
    #[default]
    Accept,
    /// Accept without a challenge, but do not reveal the CID.
    AcceptWithoutCid,
    /// Ask a question. The right answer is accepted, anything else fails.
    Question { challenge: String, answer: String },
    /// Fail verification without issuing a challenge.
    Reject { reason: String },
    /// Fail before the publication reaches the subplebbit.
    Fail(ProtocolError),
}

#[derive(Default)]
struct State {
    subplebbits: HashMap<String, Subplebbit>,
    comments: HashMap<Cid, Comment>,
    pages: HashMap<Cid, Page>,
    owned: Vec<String>,
    failing: HashSet<String>,
    policy: ChallengePolicy,
    counters: HashMap<String, usize>,
    published: Vec<Comment>,
    comment_channels: HashMap<Cid, broadcast::Sender<LiveEvent<Comment>>>,
    subplebbit_channels: HashMap<String, broadcast::Sender<LiveEvent<Subplebbit>>>,
}

impl State {
    fn count(&mut self, kind: &str, id: &str) {
        *self.counters.entry(format!("{}:{}", kind, id)).or_default() += 1;
    }

    fn comment_channel(&mut self, cid: &str) -> broadcast::Sender<LiveEvent<Comment>> {
        self.comment_channels
            .entry(cid.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn subplebbit_channel(&mut self, address: &str) -> broadcast::Sender<LiveEvent<Subplebbit>> {
        self.subplebbit_channels
            .entry(address.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

/// In-memory protocol client.
///
/// Holds a fake network of subplebbits, comments and pages, counts every
/// fetch, and lets tests push live updates and errors.
#[derive(Clone, Default)]
pub struct MemoryProtocol {
    state: Arc<RwLock<State>>,
}

impl MemoryProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh content identifier.
    pub fn generate_cid() -> Cid {
        format!("Qm{}", Ulid::new())
    }

    pub fn set_challenge_policy(&self, policy: ChallengePolicy) {
        self.state.write().policy = policy;
    }

    pub fn add_subplebbit(&self, subplebbit: Subplebbit) {
        self.state
            .write()
            .subplebbits
            .insert(subplebbit.address.clone(), subplebbit);
    }

    pub fn add_comment(&self, comment: Comment) {
        self.state.write().comments.insert(comment.cid.clone(), comment);
    }

    pub fn add_page(&self, page_cid: impl Into<Cid>, page: Page) {
        self.state.write().pages.insert(page_cid.into(), page);
    }

    /// Replace a comment and push the snapshot to its followers.
    pub fn update_comment(&self, comment: Comment) {
        let tx = {
            let mut state = self.state.write();
            state.comments.insert(comment.cid.clone(), comment.clone());
            state.comment_channel(&comment.cid)
        };
        let _ = tx.send(LiveEvent::Update(comment));
    }

    /// Replace a subplebbit and push the snapshot to its followers.
    pub fn update_subplebbit(&self, subplebbit: Subplebbit) {
        let tx = {
            let mut state = self.state.write();
            state
                .subplebbits
                .insert(subplebbit.address.clone(), subplebbit.clone());
            state.subplebbit_channel(&subplebbit.address)
        };
        let _ = tx.send(LiveEvent::Update(subplebbit));
    }

    pub fn emit_comment_error(&self, cid: &str, error: ProtocolError) {
        let tx = self.state.write().comment_channel(cid);
        let _ = tx.send(LiveEvent::Error(error));
    }

    pub fn emit_subplebbit_error(&self, address: &str, error: ProtocolError) {
        let tx = self.state.write().subplebbit_channel(address);
        let _ = tx.send(LiveEvent::Error(error));
    }

    /// Make every fetch of `id` (cid, address or page cid) fail.
    pub fn fail_fetches(&self, id: &str) {
        self.state.write().failing.insert(id.to_string());
    }

    pub fn restore_fetches(&self, id: &str) {
        self.state.write().failing.remove(id);
    }

    fn counter(&self, kind: &str, id: &str) -> usize {
        self.state
            .read()
            .counters
            .get(&format!("{}:{}", kind, id))
            .copied()
            .unwrap_or(0)
    }

    pub fn comment_fetches(&self, cid: &str) -> usize {
        self.counter("comment", cid)
    }

    pub fn subplebbit_fetches(&self, address: &str) -> usize {
        self.counter("subplebbit", address)
    }

    pub fn page_fetches(&self, page_cid: &str) -> usize {
        self.counter("page", page_cid)
    }

    /// Number of live subscriptions opened for a comment.
    pub fn comment_subscriptions(&self, cid: &str) -> usize {
        self.counter("comment-updates", cid)
    }

    /// Comments accepted by the simulated subplebbits, in order.
    pub fn published_comments(&self) -> Vec<Comment> {
        self.state.read().published.clone()
    }

    pub fn comment(&self, cid: &str) -> Option<Comment> {
        self.state.read().comments.get(cid).cloned()
    }

    fn accept_comment(&self, content: CommentContent) -> Cid {
        let comment = Comment::new(Self::generate_cid(), content);
        let cid = comment.cid.clone();
        let mut state = self.state.write();
        state.comments.insert(cid.clone(), comment.clone());
        state.published.push(comment);
        trace!(cid = %cid, "accepted comment");
        cid
    }

    async fn fetch<T, F>(&self, kind: &str, id: &str, find: F) -> ProtocolResult<T>
    where
        F: FnOnce(&State) -> Option<T> + Send,
    {
        // Fetches are never instantaneous.
        tokio::task::yield_now().await;

        let mut state = self.state.write();
        state.count(kind, id);
        if state.failing.contains(id) {
            return Err(ProtocolError::Network(format!("failed to fetch {}", id)));
        }
        find(&*state).ok_or_else(|| ProtocolError::NotFound(id.to_string()))
    }

    fn publication(&self, comment: Option<CommentContent>) -> Arc<dyn Publication> {
        let (answers_tx, answers_rx) = mpsc::unbounded_channel();
        Arc::new(MemoryPublication {
            protocol: self.clone(),
            comment,
            answers_tx,
            answers_rx: Mutex::new(Some(answers_rx)),
        })
    }
}

struct MemoryPublication {
    protocol: MemoryProtocol,
    /// Content of a comment publication, `None` for votes and edits.
    comment: Option<CommentContent>,
    answers_tx: mpsc::UnboundedSender<Vec<String>>,
    answers_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<String>>>>,
}

fn verification(success: bool, cid: Option<Cid>, reason: Option<String>) -> PublicationEvent {
    PublicationEvent::ChallengeVerification(ChallengeVerification {
        success,
        publication_cid: cid,
        reason,
    })
}

#[async_trait]
impl Publication for MemoryPublication {
    async fn publish(&self) -> ProtocolResult<BoxStream<'static, PublicationEvent>> {
        let policy = self.protocol.state.read().policy.clone();
        if let ChallengePolicy::Fail(error) = &policy {
            return Err(error.clone());
        }
        let mut answers = self
            .answers_rx
            .lock()
            .take()
            .ok_or_else(|| ProtocolError::Network("publication already published".to_string()))?;
        let protocol = self.protocol.clone();
        let comment = self.comment.clone();

        Ok(Box::pin(stream! {
            let verdict = match policy {
                ChallengePolicy::Accept => Ok(true),
                ChallengePolicy::AcceptWithoutCid => Ok(false),
                ChallengePolicy::Reject { reason } => Err(reason),
                ChallengePolicy::Fail(error) => Err(error.to_string()),
                ChallengePolicy::Question { challenge, answer } => {
                    yield PublicationEvent::Challenge(Challenge {
                        challenge,
                        kind: "text/plain".to_string(),
                    });
                    match answers.recv().await {
                        Some(given) if given.first() == Some(&answer) => Ok(true),
                        _ => Err("wrong challenge answer".to_string()),
                    }
                }
            };

            match verdict {
                Ok(reveal_cid) => {
                    let cid = comment.map(|content| protocol.accept_comment(content));
                    yield verification(true, cid.filter(|_| reveal_cid), None);
                }
                Err(reason) => yield verification(false, None, Some(reason)),
            }
        }))
    }

    async fn publish_challenge_answers(&self, answers: Vec<String>) -> ProtocolResult<()> {
        self.answers_tx
            .send(answers)
            .map_err(|_| ProtocolError::Network("no challenge pending".to_string()))
    }
}

#[async_trait]
impl Protocol for MemoryProtocol {
    async fn create_signer(&self) -> ProtocolResult<Signer> {
        Ok(Signer {
            private_key: Ulid::new().to_string(),
            address: format!("12D3KooW{}", Ulid::new()),
            kind: "ed25519".to_string(),
        })
    }

    async fn create_comment(
        &self,
        _signer: &Signer,
        content: &CommentContent,
    ) -> ProtocolResult<Arc<dyn Publication>> {
        Ok(self.publication(Some(content.clone())))
    }

    async fn create_vote(
        &self,
        _signer: &Signer,
        _vote: &Draft<VoteOptions>,
    ) -> ProtocolResult<Arc<dyn Publication>> {
        Ok(self.publication(None))
    }

    async fn create_comment_edit(
        &self,
        _signer: &Signer,
        _edit: &Draft<CommentEditOptions>,
    ) -> ProtocolResult<Arc<dyn Publication>> {
        Ok(self.publication(None))
    }

    async fn create_subplebbit_edit(
        &self,
        _signer: &Signer,
        _edit: &Draft<SubplebbitEditOptions>,
    ) -> ProtocolResult<Arc<dyn Publication>> {
        Ok(self.publication(None))
    }

    async fn create_subplebbit(
        &self,
        signer: &Signer,
        options: &SubplebbitOptions,
    ) -> ProtocolResult<Subplebbit> {
        let mut state = self.state.write();
        if let Some(existing) = options
            .address
            .as_ref()
            .and_then(|address| state.subplebbits.get(address))
        {
            return Ok(existing.clone());
        }

        let address = options
            .address
            .clone()
            .unwrap_or_else(|| format!("12D3KooW{}", Ulid::new()));
        let mut subplebbit = Subplebbit::new(address.clone());
        subplebbit.title = options.title.clone();
        subplebbit.description = options.description.clone();
        subplebbit.roles = Some(BTreeMap::from([(
            signer.address.clone(),
            Role::new(RoleKind::Owner),
        )]));
        subplebbit.created_at = Some(chrono::Utc::now().timestamp());

        state.subplebbits.insert(address.clone(), subplebbit.clone());
        state.owned.push(address);
        Ok(subplebbit)
    }

    async fn get_comment(&self, cid: &str) -> ProtocolResult<Comment> {
        self.fetch("comment", cid, |state| state.comments.get(cid).cloned())
            .await
    }

    async fn get_subplebbit(&self, address: &str) -> ProtocolResult<Subplebbit> {
        self.fetch("subplebbit", address, |state| {
            state.subplebbits.get(address).cloned()
        })
        .await
    }

    async fn get_page(&self, _subplebbit_address: &str, page_cid: &str) -> ProtocolResult<Page> {
        self.fetch("page", page_cid, |state| state.pages.get(page_cid).cloned())
            .await
    }

    async fn list_subplebbits(&self) -> ProtocolResult<Vec<String>> {
        Ok(self.state.read().owned.clone())
    }

    fn comment_updates(&self, cid: &str) -> BoxStream<'static, LiveEvent<Comment>> {
        let mut rx = {
            let mut state = self.state.write();
            state.count("comment-updates", cid);
            state.comment_channel(cid).subscribe()
        };
        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn subplebbit_updates(&self, address: &str) -> BoxStream<'static, LiveEvent<Subplebbit>> {
        let mut rx = {
            let mut state = self.state.write();
            state.count("subplebbit-updates", address);
            state.subplebbit_channel(address).subscribe()
        };
        Box::pin(stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
