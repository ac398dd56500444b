//! Publish pipeline.
//!
//! One driver task per publication:
//!
//! ```text
//! Drafted ─> Submitted ─┬─> Challenged ─> Answered ─┬─> Verified
//!               ^       │                           ├─> Rejected
//!               │       └───────────────────────────┘
//!               └──── retry (verification failed after a challenge)
//! ```
//!
//! `Stopped` is reached when the caller stops the handle or the store resets.

use super::{AccountEvent, AccountsStore};
use crate::error::{Result, SdkError};
use crate::protocol::{
    Challenge, ChallengeVerification, CommentEditOptions, Draft, ProtocolError, Publication,
    PublicationEvent, SubplebbitEditOptions, VoteOptions,
};
use futures::StreamExt;
use plebsync_core::{AccountId, AccountVote, Cid, CommentContent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// What the caller provides for a new comment; author and timestamp are
/// stamped by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentOptions {
    pub subplebbit_address: String,
    pub title: Option<String>,
    pub content: Option<String>,
    pub link: Option<String>,
    pub parent_cid: Option<Cid>,
    pub post_cid: Option<Cid>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishState {
    Drafted,
    Submitted { attempt: u32 },
    Challenged { attempt: u32 },
    Answered { attempt: u32 },
    /// Accepted. Comments carry their CID once the network reveals it.
    Verified { cid: Option<Cid> },
    Rejected { reason: String },
    Stopped,
}

impl PublishState {
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PublishState::Verified { .. } | PublishState::Rejected { .. } | PublishState::Stopped
        )
    }
}

type ChallengeFn = dyn Fn(Challenge, ChallengeAnswerer) + Send + Sync;
type VerificationFn = dyn Fn(&ChallengeVerification) + Send + Sync;
type ErrorFn = dyn Fn(&SdkError) + Send + Sync;

/// Caller hooks invoked by the publish driver.
#[derive(Clone, Default)]
pub struct PublishCallbacks {
    on_challenge: Option<Arc<ChallengeFn>>,
    on_challenge_verification: Option<Arc<VerificationFn>>,
    on_error: Option<Arc<ErrorFn>>,
}

impl PublishCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_challenge(
        mut self,
        callback: impl Fn(Challenge, ChallengeAnswerer) + Send + Sync + 'static,
    ) -> Self {
        self.on_challenge = Some(Arc::new(callback));
        self
    }

    pub fn on_challenge_verification(
        mut self,
        callback: impl Fn(&ChallengeVerification) + Send + Sync + 'static,
    ) -> Self {
        self.on_challenge_verification = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&SdkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    fn error(&self, error: &SdkError) {
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }
}

impl fmt::Debug for PublishCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishCallbacks")
            .field("on_challenge", &self.on_challenge.is_some())
            .field(
                "on_challenge_verification",
                &self.on_challenge_verification.is_some(),
            )
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Answers the challenge of one publish attempt.
#[derive(Clone)]
pub struct ChallengeAnswerer {
    publication: Arc<dyn Publication>,
    state: Arc<watch::Sender<PublishState>>,
    attempt: u32,
}

impl ChallengeAnswerer {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn answer(&self, answers: Vec<String>) -> Result<()> {
        self.publication.publish_challenge_answers(answers).await?;
        let attempt = self.attempt;
        self.state.send_if_modified(|state| {
            if *state == (PublishState::Challenged { attempt }) {
                *state = PublishState::Answered { attempt };
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

impl fmt::Debug for ChallengeAnswerer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeAnswerer")
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Observes and controls a running publication.
pub struct PublishHandle {
    index: Option<usize>,
    state: Arc<watch::Sender<PublishState>>,
    task: Option<AbortHandle>,
}

impl PublishHandle {
    /// Log index of the comment or vote; `None` for edits.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn state(&self) -> PublishState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PublishState> {
        self.state.subscribe()
    }

    /// Wait until the publication is verified, rejected or stopped.
    pub async fn wait_settled(&self) -> PublishState {
        let mut receiver = self.state.subscribe();
        loop {
            let state = receiver.borrow_and_update().clone();
            if state.is_settled() {
                return state;
            }
            if receiver.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Stop the driver, including pending retries.
    pub fn stop(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
        settle_stopped(&self.state);
    }
}

impl fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishHandle")
            .field("index", &self.index)
            .field("state", &self.state())
            .finish()
    }
}

fn settle_stopped(state: &watch::Sender<PublishState>) {
    state.send_if_modified(|state| {
        if state.is_settled() {
            false
        } else {
            *state = PublishState::Stopped;
            true
        }
    });
}

/// Settles the handle and releases the driver key however the driver ends.
struct DriverGuard {
    store: Arc<AccountsStore>,
    key: String,
    state: Arc<watch::Sender<PublishState>>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        settle_stopped(&self.state);
        self.store.publishing.remove(&self.key);
    }
}

enum PublicationKind {
    Comment {
        account_id: AccountId,
        index: usize,
    },
    Vote {
        account_id: AccountId,
        index: usize,
    },
    CommentEdit {
        account_id: AccountId,
        draft: Draft<CommentEditOptions>,
    },
    SubplebbitEdit {
        account_id: AccountId,
        draft: Draft<SubplebbitEditOptions>,
    },
}

impl PublicationKind {
    fn account_id(&self) -> &AccountId {
        match self {
            PublicationKind::Comment { account_id, .. }
            | PublicationKind::Vote { account_id, .. }
            | PublicationKind::CommentEdit { account_id, .. }
            | PublicationKind::SubplebbitEdit { account_id, .. } => account_id,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PublicationKind::Comment { .. } => "comment",
            PublicationKind::Vote { .. } => "vote",
            PublicationKind::CommentEdit { .. } => "comment edit",
            PublicationKind::SubplebbitEdit { .. } => "subplebbit edit",
        }
    }
}

enum Outcome {
    Verified(Option<Cid>),
    Failed { reason: String, challenged: bool },
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(SdkError::InvalidArgument(format!("{} is empty", what)));
    }
    Ok(())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl AccountsStore {
    /// Append a comment to the account's log and start publishing it.
    pub async fn publish_comment(
        self: &Arc<Self>,
        options: CommentOptions,
        account_name: Option<&str>,
        callbacks: PublishCallbacks,
    ) -> Result<PublishHandle> {
        require(&options.subplebbit_address, "subplebbit address")?;
        let has_body = [&options.title, &options.content, &options.link]
            .iter()
            .any(|field| field.as_deref().is_some_and(|s| !s.trim().is_empty()));
        if !has_body {
            return Err(SdkError::InvalidArgument(
                "comment needs a title, content or link".to_string(),
            ));
        }
        if options.parent_cid.is_some() != options.post_cid.is_some() {
            return Err(SdkError::InvalidArgument(
                "a reply needs both parent_cid and post_cid".to_string(),
            ));
        }

        let append = self.appends.lock().await;
        let entry = {
            let state = self.state.read();
            let account = state.account(account_name)?;
            let account_id = account.id.clone();
            let content = CommentContent {
                subplebbit_address: options.subplebbit_address,
                author: account.author.clone(),
                timestamp: now(),
                title: options.title,
                content: options.content,
                link: options.link,
                parent_cid: options.parent_cid,
                post_cid: options.post_cid,
                depth: None,
            };
            let index = state.comments.get(&account_id).map_or(0, Vec::len);
            plebsync_core::AccountComment::new(index, account_id, content)
        };
        self.database.save_account_comment(&entry).await?;
        self.state
            .write()
            .comments
            .entry(entry.account_id.clone())
            .or_default()
            .push(entry.clone());
        drop(append);
        self.emit(AccountEvent::CommentsChanged(entry.account_id.clone()));
        info!(
            account_id = %entry.account_id,
            index = entry.index,
            address = %entry.content.subplebbit_address,
            "publishing comment"
        );

        let index = entry.index;
        Ok(self.spawn_publication(
            PublicationKind::Comment {
                account_id: entry.account_id,
                index,
            },
            Some(index),
            callbacks,
        ))
    }

    /// Append a vote to the account's log and start publishing it.
    pub async fn publish_vote(
        self: &Arc<Self>,
        options: VoteOptions,
        account_name: Option<&str>,
        callbacks: PublishCallbacks,
    ) -> Result<PublishHandle> {
        require(&options.comment_cid, "comment cid")?;
        require(&options.subplebbit_address, "subplebbit address")?;
        if !(-1..=1).contains(&options.vote) {
            return Err(SdkError::InvalidArgument(format!(
                "vote must be -1, 0 or 1, got {}",
                options.vote
            )));
        }

        let append = self.appends.lock().await;
        let (account_id, index, vote) = {
            let state = self.state.read();
            let account_id = state.account(account_name)?.id.clone();
            let vote = AccountVote {
                comment_cid: options.comment_cid,
                vote: options.vote,
                timestamp: now(),
                subplebbit_address: options.subplebbit_address,
            };
            let index = state.votes.get(&account_id).map_or(0, Vec::len);
            (account_id, index, vote)
        };
        self.database
            .save_account_vote(&account_id, index, &vote)
            .await?;
        self.state
            .write()
            .votes
            .entry(account_id.clone())
            .or_default()
            .push(vote.clone());
        drop(append);
        self.emit(AccountEvent::VotesChanged(account_id.clone()));
        info!(account_id = %account_id, index, cid = %vote.comment_cid, vote = vote.vote, "publishing vote");

        Ok(self.spawn_publication(
            PublicationKind::Vote { account_id, index },
            Some(index),
            callbacks,
        ))
    }

    pub async fn publish_comment_edit(
        self: &Arc<Self>,
        options: CommentEditOptions,
        account_name: Option<&str>,
        callbacks: PublishCallbacks,
    ) -> Result<PublishHandle> {
        require(&options.comment_cid, "comment cid")?;
        require(&options.subplebbit_address, "subplebbit address")?;

        let (account_id, draft) = {
            let state = self.state.read();
            let account = state.account(account_name)?;
            let draft = Draft {
                author: account.author.clone(),
                timestamp: now(),
                options,
            };
            (account.id.clone(), draft)
        };
        info!(account_id = %account_id, cid = %draft.options.comment_cid, "publishing comment edit");
        Ok(self.spawn_publication(
            PublicationKind::CommentEdit { account_id, draft },
            None,
            callbacks,
        ))
    }

    pub async fn publish_subplebbit_edit(
        self: &Arc<Self>,
        options: SubplebbitEditOptions,
        account_name: Option<&str>,
        callbacks: PublishCallbacks,
    ) -> Result<PublishHandle> {
        require(&options.subplebbit_address, "subplebbit address")?;

        let (account_id, draft) = {
            let state = self.state.read();
            let account = state.account(account_name)?;
            let draft = Draft {
                author: account.author.clone(),
                timestamp: now(),
                options,
            };
            (account.id.clone(), draft)
        };
        info!(
            account_id = %account_id,
            address = %draft.options.subplebbit_address,
            "publishing subplebbit edit"
        );
        Ok(self.spawn_publication(
            PublicationKind::SubplebbitEdit { account_id, draft },
            None,
            callbacks,
        ))
    }

    fn spawn_publication(
        self: &Arc<Self>,
        kind: PublicationKind,
        index: Option<usize>,
        callbacks: PublishCallbacks,
    ) -> PublishHandle {
        let state = Arc::new(watch::channel(PublishState::Drafted).0);
        let key = format!("{}/publish/{}", kind.account_id(), Ulid::new());
        let guard = DriverGuard {
            store: Arc::clone(self),
            key: key.clone(),
            state: state.clone(),
        };
        let store = Arc::clone(self);
        let task = self.publishing.start(&key, move |_| {
            tokio::spawn(async move {
                store.drive(kind, callbacks, guard).await;
            })
        });
        PublishHandle { index, state, task }
    }

    async fn drive(self: Arc<Self>, mut kind: PublicationKind, callbacks: PublishCallbacks, guard: DriverGuard) {
        let state = guard.state.clone();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&mut kind, attempt, &callbacks, &state).await {
                Ok(Outcome::Verified(cid)) => {
                    debug!(kind = kind.label(), attempt, cid = ?cid, "publication verified");
                    if let (PublicationKind::Comment { account_id, index }, Some(cid)) = (&kind, &cid) {
                        if let Err(e) = self.record_publication_cid(account_id, *index, cid).await {
                            warn!(account_id = %account_id, index, error = %e, "failed to record comment cid");
                        }
                    }
                    state.send_replace(PublishState::Verified { cid });
                    break;
                }
                Ok(Outcome::Failed {
                    reason,
                    challenged: true,
                }) if self.config.retry_policy.allows_retry_after(attempt) => {
                    debug!(kind = kind.label(), attempt, reason = %reason, "challenge failed, retrying");
                }
                Ok(Outcome::Failed { reason, challenged }) => {
                    if !challenged {
                        callbacks.error(&SdkError::PublishRejected(reason.clone()));
                    }
                    info!(kind = kind.label(), attempt, reason = %reason, "publication rejected");
                    state.send_replace(PublishState::Rejected { reason });
                    break;
                }
                Err(error) => {
                    warn!(kind = kind.label(), attempt, error = %error, "publication failed");
                    callbacks.error(&error);
                    state.send_replace(PublishState::Rejected {
                        reason: error.to_string(),
                    });
                    break;
                }
            }
        }
    }

    async fn attempt(
        &self,
        kind: &mut PublicationKind,
        attempt: u32,
        callbacks: &PublishCallbacks,
        state: &Arc<watch::Sender<PublishState>>,
    ) -> Result<Outcome> {
        state.send_replace(PublishState::Submitted { attempt });
        let publication = self.create_publication(kind, attempt).await?;
        let mut events = publication.publish().await?;

        let mut challenged = false;
        while let Some(event) = events.next().await {
            match event {
                PublicationEvent::Challenge(challenge) => {
                    challenged = true;
                    state.send_replace(PublishState::Challenged { attempt });
                    debug!(kind = kind.label(), attempt, "challenge received");
                    if let Some(on_challenge) = &callbacks.on_challenge {
                        on_challenge(
                            challenge,
                            ChallengeAnswerer {
                                publication: publication.clone(),
                                state: state.clone(),
                                attempt,
                            },
                        );
                    }
                }
                PublicationEvent::ChallengeVerification(verification) => {
                    if let Some(on_verification) = &callbacks.on_challenge_verification {
                        on_verification(&verification);
                    }
                    if verification.success {
                        return Ok(Outcome::Verified(verification.publication_cid));
                    }
                    return Ok(Outcome::Failed {
                        reason: verification
                            .reason
                            .unwrap_or_else(|| "challenge verification failed".to_string()),
                        challenged,
                    });
                }
                PublicationEvent::Error(error) => return Err(error.into()),
            }
        }
        Err(ProtocolError::Network("publication ended before verification".to_string()).into())
    }

    /// Build the protocol publication. Retries refresh the timestamp and
    /// overwrite the log entry in place.
    async fn create_publication(
        &self,
        kind: &mut PublicationKind,
        attempt: u32,
    ) -> Result<Arc<dyn Publication>> {
        let retry = attempt > 1;
        match kind {
            PublicationKind::Comment { account_id, index } => {
                let (signer, entry) = {
                    let mut guard = self.state.write();
                    let state = &mut *guard;
                    let signer = state.account_by_id(account_id)?.signer.clone();
                    let entry = state
                        .comments
                        .get_mut(account_id)
                        .and_then(|log| log.get_mut(*index))
                        .ok_or_else(|| SdkError::AccountNotFound(account_id.to_string()))?;
                    if retry {
                        entry.content.timestamp = now();
                    }
                    (signer, entry.clone())
                };
                if retry {
                    self.database.save_account_comment(&entry).await?;
                    self.emit(AccountEvent::CommentsChanged(account_id.clone()));
                }
                Ok(self.protocol.create_comment(&signer, &entry.content).await?)
            }
            PublicationKind::Vote { account_id, index } => {
                let (signer, author, vote) = {
                    let mut guard = self.state.write();
                    let state = &mut *guard;
                    let account = state.account_by_id(account_id)?;
                    let (signer, author) = (account.signer.clone(), account.author.clone());
                    let vote = state
                        .votes
                        .get_mut(account_id)
                        .and_then(|log| log.get_mut(*index))
                        .ok_or_else(|| SdkError::AccountNotFound(account_id.to_string()))?;
                    if retry {
                        vote.timestamp = now();
                    }
                    (signer, author, vote.clone())
                };
                if retry {
                    self.database
                        .save_account_vote(account_id, *index, &vote)
                        .await?;
                    self.emit(AccountEvent::VotesChanged(account_id.clone()));
                }
                let draft = Draft {
                    author,
                    timestamp: vote.timestamp,
                    options: VoteOptions {
                        comment_cid: vote.comment_cid,
                        subplebbit_address: vote.subplebbit_address,
                        vote: vote.vote,
                    },
                };
                Ok(self.protocol.create_vote(&signer, &draft).await?)
            }
            PublicationKind::CommentEdit { account_id, draft } => {
                let signer = self.state.read().account_by_id(account_id)?.signer.clone();
                if retry {
                    draft.timestamp = now();
                }
                Ok(self.protocol.create_comment_edit(&signer, draft).await?)
            }
            PublicationKind::SubplebbitEdit { account_id, draft } => {
                let signer = self.state.read().account_by_id(account_id)?.signer.clone();
                if retry {
                    draft.timestamp = now();
                }
                Ok(self.protocol.create_subplebbit_edit(&signer, draft).await?)
            }
        }
    }

    /// Store the CID revealed by a successful verification, unless
    /// reconciliation got there first.
    async fn record_publication_cid(
        self: &Arc<Self>,
        account_id: &AccountId,
        index: usize,
        cid: &Cid,
    ) -> Result<()> {
        let entry = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(entry) = state
                .comments
                .get_mut(account_id)
                .and_then(|log| log.get_mut(index))
            else {
                return Ok(());
            };
            if entry.cid.is_some() {
                return Ok(());
            }
            entry.cid = Some(cid.clone());
            let entry = entry.clone();
            state
                .comment_cids
                .insert(cid.clone(), (account_id.clone(), index));
            entry
        };
        self.database.save_account_comment(&entry).await?;
        self.emit(AccountEvent::CommentsChanged(account_id.clone()));
        self.start_comment_updates(account_id, index, cid);
        Ok(())
    }
}
