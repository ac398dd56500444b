mod common;

use common::{fast_config, open, open_with, page_cid, wait_until, ControlledStorage};
use futures::future::join_all;
use plebsync_cache::FileStorage;
use plebsync_core::{CommentContent, Pages};
use plebsync_sdk::{
    AccountEvent, Author, ChallengePolicy, ClientConfig, Comment, CommentOptions, MemoryProtocol, Page,
    ProtocolError, PublishCallbacks, PublishState, RetryPolicy, RoleKind, SdkError, SortType,
    Subplebbit, SubplebbitOptions, VoteOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn hello() -> CommentOptions {
    CommentOptions {
        subplebbit_address: "news.eth".to_string(),
        content: Some("hello".to_string()),
        ..Default::default()
    }
}

fn question() -> ChallengePolicy {
    ChallengePolicy::Question {
        challenge: "2 + 2".to_string(),
        answer: "4".to_string(),
    }
}

/// Answers wrong `wrong` times, then right. Counts the challenges.
fn answering(wrong: usize, challenges: Arc<AtomicUsize>) -> PublishCallbacks {
    PublishCallbacks::new().on_challenge(move |_challenge, answerer| {
        let seen = challenges.fetch_add(1, Ordering::SeqCst);
        let answer = if seen < wrong { "5" } else { "4" };
        tokio::spawn(async move {
            answerer.answer(vec![answer.to_string()]).await.unwrap();
        });
    })
}

#[tokio::test]
async fn test_publish_without_challenge_records_cid() {
    let protocol = MemoryProtocol::new();
    let client = open(&protocol).await;

    let handle = client
        .accounts()
        .publish_comment(hello(), None, PublishCallbacks::new())
        .await
        .unwrap();
    assert_eq!(handle.index(), Some(0));

    let state = handle.wait_settled().await;
    let PublishState::Verified { cid: Some(cid) } = state else {
        panic!("unexpected state: {:?}", state);
    };
    let comments = client.accounts().account_comments(None).unwrap();
    assert_eq!(comments[0].cid.as_deref(), Some(cid.as_str()));
    assert_eq!(client.accounts().account_comment(&cid).unwrap().index, 0);
    assert_eq!(protocol.published_comments().len(), 1);
    assert_eq!(protocol.comment_subscriptions(&cid), 1);
}

#[tokio::test]
async fn test_withheld_cid_is_reconciled_from_a_page_once() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(ChallengePolicy::AcceptWithoutCid);
    let client = open(&protocol).await;

    let handle = client
        .accounts()
        .publish_comment(hello(), None, PublishCallbacks::new())
        .await
        .unwrap();
    assert_eq!(
        handle.wait_settled().await,
        PublishState::Verified { cid: None }
    );
    assert!(client.accounts().account_comments(None).unwrap()[0]
        .cid
        .is_none());

    // The subplebbit lists the comment in its first page.
    let published = protocol.published_comments().remove(0);
    let cid = published.cid.clone();
    protocol.add_page(page_cid("news.eth", 0), Page::new(vec![published], None));
    let mut subplebbit = Subplebbit::new("news.eth");
    let mut posts = Pages::default();
    posts.page_cids.insert(SortType::New, page_cid("news.eth", 0));
    subplebbit.posts = Some(posts);
    protocol.add_subplebbit(subplebbit);

    let account = client.accounts().active_account().unwrap();
    client
        .feeds()
        .add_feed_to_store(&account, ["news.eth"], SortType::New, false)
        .unwrap();
    let accounts = client.accounts();
    wait_until("reconciliation", || {
        accounts.account_comment(&cid).is_some()
    })
    .await;

    // A second sighting through the comment store changes nothing.
    client
        .comments()
        .add_comment_to_store(&cid, &account)
        .await
        .unwrap();
    wait_until("comment", || client.comments().get(&cid).is_some()).await;
    let comments = accounts.account_comments(None).unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].cid.as_deref(), Some(cid.as_str()));
    assert_eq!(comments[0].content.content.as_deref(), Some("hello"));
    // One live subscription from the account store, one from the comment store.
    assert_eq!(protocol.comment_subscriptions(&cid), 2);
}

/// A subplebbit listing `comments` in an inline `New` page.
fn with_inline_posts(address: &str, comments: Vec<Comment>) -> Subplebbit {
    let mut subplebbit = Subplebbit::new(address);
    let mut posts = Pages::default();
    posts.pages.insert(SortType::New, Page::new(comments, None));
    subplebbit.posts = Some(posts);
    subplebbit
}

async fn publish_withheld(client: &plebsync_sdk::Client, options: CommentOptions) {
    let handle = client
        .accounts()
        .publish_comment(options, None, PublishCallbacks::new())
        .await
        .unwrap();
    assert_eq!(
        handle.wait_settled().await,
        PublishState::Verified { cid: None }
    );
}

#[tokio::test]
async fn test_withheld_cid_is_reconciled_from_an_inline_page() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(ChallengePolicy::AcceptWithoutCid);
    let client = open(&protocol).await;
    publish_withheld(&client, hello()).await;

    let published = protocol.published_comments().remove(0);
    let cid = published.cid.clone();
    protocol.add_subplebbit(with_inline_posts("news.eth", vec![published.clone()]));

    let account = client.accounts().active_account().unwrap();
    let feeds = client.feeds();
    let key = feeds
        .add_feed_to_store(&account, ["news.eth"], SortType::New, false)
        .unwrap();
    wait_until("inline post", || {
        feeds.feed(&key).is_some_and(|feed| feed.loaded.len() == 1)
    })
    .await;
    let accounts = client.accounts();
    wait_until("reconciliation", || accounts.account_comment(&cid).is_some()).await;
    assert_eq!(accounts.account_comment(&cid).unwrap().index, 0);

    // A later snapshot of the subplebbit carries the next publication.
    publish_withheld(&client, hello()).await;
    let second = protocol.published_comments().remove(1);
    protocol.update_subplebbit(with_inline_posts(
        "news.eth",
        vec![second.clone(), published],
    ));
    wait_until("reconciliation from the update", || {
        accounts.account_comment(&second.cid).is_some()
    })
    .await;
    assert_eq!(accounts.account_comment(&second.cid).unwrap().index, 1);
}

#[tokio::test]
async fn test_withheld_reply_is_reconciled_from_its_parent() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(ChallengePolicy::AcceptWithoutCid);
    let client = open(&protocol).await;
    publish_withheld(
        &client,
        CommentOptions {
            parent_cid: Some("QmParent".to_string()),
            post_cid: Some("QmParent".to_string()),
            ..hello()
        },
    )
    .await;

    let reply = protocol.published_comments().remove(0);
    let mut parent = Comment::new(
        "QmParent",
        CommentContent {
            subplebbit_address: "news.eth".to_string(),
            author: Author::new("12D3KooWFriend"),
            timestamp: 1_700_000_000,
            title: Some("parent".to_string()),
            ..Default::default()
        },
    );
    let mut replies = Pages::default();
    replies
        .pages
        .insert(SortType::New, Page::new(vec![reply.clone()], None));
    parent.update.replies = Some(replies);
    protocol.add_comment(parent);

    let account = client.accounts().active_account().unwrap();
    client
        .comments()
        .add_comment_to_store("QmParent", &account)
        .await
        .unwrap();
    let entry = client.accounts().account_comment(&reply.cid).unwrap();
    assert_eq!(entry.content.parent_cid.as_deref(), Some("QmParent"));
}

#[tokio::test]
async fn test_reconciliation_survives_lagging_subscribers() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(ChallengePolicy::AcceptWithoutCid);
    let config = ClientConfig::builder()
        .feeds_update_interval(std::time::Duration::from_millis(5))
        .event_channel_capacity(1)
        .build();
    let client = open_with(&protocol, Arc::new(plebsync_cache::MemoryStorage::new()), config).await;

    for i in 0..20 {
        publish_withheld(
            &client,
            CommentOptions {
                subplebbit_address: format!("sub{}.eth", i),
                ..hello()
            },
        )
        .await;
    }

    let mut subplebbits = Vec::new();
    for comment in protocol.published_comments() {
        let address = comment.subplebbit_address().to_string();
        protocol.add_page(page_cid(&address, 0), Page::new(vec![comment], None));
        let mut subplebbit = Subplebbit::new(&address);
        let mut posts = Pages::default();
        posts.page_cids.insert(SortType::New, page_cid(&address, 0));
        subplebbit.posts = Some(posts);
        subplebbits.push(subplebbit);
    }
    assert_eq!(subplebbits.len(), 20);

    let account = client.accounts().active_account().unwrap();
    let pages = client.pages();
    let results = join_all(
        subplebbits
            .iter()
            .map(|subplebbit| pages.add_next_page_to_store(subplebbit, SortType::New, &account)),
    )
    .await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(pages.len(), 20);

    let comments = client.accounts().account_comments(None).unwrap();
    assert_eq!(comments.len(), 20);
    assert!(comments.iter().all(|comment| comment.cid.is_some()));
}

#[tokio::test]
async fn test_failed_append_leaves_the_log_untouched() {
    let protocol = MemoryProtocol::new();
    let storage = ControlledStorage::new();
    let client = open_with(&protocol, storage.clone(), fast_config()).await;
    let accounts = client.accounts();
    let account_id = accounts.active_account().unwrap().id;

    storage.refuse_writes(Some(&format!("comments-{}", account_id)));
    let result = accounts
        .publish_comment(hello(), None, PublishCallbacks::new())
        .await;
    assert!(matches!(result, Err(SdkError::Cache(_))));
    assert!(accounts.account_comments(None).unwrap().is_empty());
    assert!(protocol.published_comments().is_empty());

    storage.refuse_writes(None);
    let handle = accounts
        .publish_comment(hello(), None, PublishCallbacks::new())
        .await
        .unwrap();
    assert_eq!(handle.index(), Some(0));
    assert!(matches!(
        handle.wait_settled().await,
        PublishState::Verified { cid: Some(_) }
    ));
    assert_eq!(accounts.account_comments(None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_reply_arriving_while_marking_as_read_stays_unread() {
    let protocol = MemoryProtocol::new();
    let storage = ControlledStorage::new();
    let client = open_with(&protocol, storage.clone(), fast_config()).await;
    let accounts = client.accounts().clone();

    let handle = accounts
        .publish_comment(hello(), None, PublishCallbacks::new())
        .await
        .unwrap();
    let PublishState::Verified { cid: Some(cid) } = handle.wait_settled().await else {
        panic!("publication was not verified");
    };
    let mine = protocol.comment(&cid).unwrap();

    let reply = |reply_cid: &str| {
        Comment::new(
            reply_cid,
            CommentContent {
                subplebbit_address: "news.eth".to_string(),
                author: Author::new("12D3KooWFriend"),
                timestamp: mine.timestamp() + 10,
                parent_cid: Some(cid.clone()),
                post_cid: Some(cid.clone()),
                content: Some("reply".to_string()),
                ..Default::default()
            },
        )
    };
    let with_replies = |replies: Vec<Comment>| {
        let mut update = mine.clone();
        let mut pages = Pages::default();
        pages.pages.insert(SortType::New, Page::new(replies, None));
        update.update.replies = Some(pages);
        update
    };

    // The first reply is persisted before any write is parked.
    let account_id = accounts.active_account().unwrap().id;
    let mut events = accounts.subscribe_events();
    protocol.update_comment(with_replies(vec![reply("QmR1")]));
    while events.recv().await.unwrap() != AccountEvent::RepliesChanged(account_id.clone()) {}
    assert_eq!(accounts.notifications(None).unwrap().len(), 1);

    // Park the persists of the read flags, and let a reply land meanwhile.
    storage.hold_writes("commentReplies-");
    let marking = tokio::spawn({
        let accounts = accounts.clone();
        async move { accounts.mark_notifications_as_read(None).await }
    });
    wait_until("parked persist", || storage.held() >= 1).await;
    protocol.update_comment(with_replies(vec![reply("QmR1"), reply("QmR2")]));
    wait_until("second reply", || {
        accounts.notifications(None).is_ok_and(|n| n.len() == 2)
    })
    .await;
    storage.release();
    assert_eq!(marking.await.unwrap().unwrap(), 1);

    let notifications = accounts.notifications(None).unwrap();
    let read = |reply_cid: &str| {
        notifications
            .iter()
            .find(|n| n.comment.cid == reply_cid)
            .map(|n| n.marked_as_read)
    };
    assert_eq!(read("QmR1"), Some(true));
    assert_eq!(read("QmR2"), Some(false));
}

#[tokio::test]
async fn test_failed_challenge_is_retried_in_place() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(question());
    let client = open(&protocol).await;
    let challenges = Arc::new(AtomicUsize::new(0));

    let handle = client
        .accounts()
        .publish_comment(hello(), None, answering(2, challenges.clone()))
        .await
        .unwrap();

    assert!(matches!(
        handle.wait_settled().await,
        PublishState::Verified { cid: Some(_) }
    ));
    assert_eq!(challenges.load(Ordering::SeqCst), 3);
    // Retries overwrite the same log entry.
    let comments = client.accounts().account_comments(None).unwrap();
    assert_eq!(comments.len(), 1);
    assert!(comments[0].cid.is_some());
    assert_eq!(protocol.published_comments().len(), 1);
}

#[tokio::test]
async fn test_retries_stop_at_the_policy_limit() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(question());
    let config = ClientConfig::builder()
        .retry_policy(RetryPolicy::max_attempts(2))
        .build();
    let client = open_with(
        &protocol,
        Arc::new(plebsync_cache::MemoryStorage::new()),
        config,
    )
    .await;
    let challenges = Arc::new(AtomicUsize::new(0));
    let verifications = Arc::new(AtomicUsize::new(0));
    let counted = verifications.clone();

    let handle = client
        .accounts()
        .publish_comment(
            hello(),
            None,
            answering(usize::MAX, challenges.clone()).on_challenge_verification(
                move |verification| {
                    assert!(!verification.success);
                    counted.fetch_add(1, Ordering::SeqCst);
                },
            ),
        )
        .await
        .unwrap();

    assert!(matches!(
        handle.wait_settled().await,
        PublishState::Rejected { .. }
    ));
    assert_eq!(challenges.load(Ordering::SeqCst), 2);
    assert_eq!(verifications.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rejection_without_challenge_is_not_retried() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(ChallengePolicy::Reject {
        reason: "banned".to_string(),
    });
    let client = open(&protocol).await;
    let errors = Arc::new(AtomicUsize::new(0));
    let counted = errors.clone();

    let handle = client
        .accounts()
        .publish_comment(
            hello(),
            None,
            PublishCallbacks::new().on_error(move |error| {
                assert!(matches!(error, SdkError::PublishRejected(reason) if reason == "banned"));
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    assert_eq!(
        handle.wait_settled().await,
        PublishState::Rejected {
            reason: "banned".to_string()
        }
    );
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_protocol_failure_reaches_on_error() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(ChallengePolicy::Fail(ProtocolError::Network(
        "offline".to_string(),
    )));
    let client = open(&protocol).await;
    let errors = Arc::new(AtomicUsize::new(0));
    let counted = errors.clone();

    let handle = client
        .accounts()
        .publish_comment(
            hello(),
            None,
            PublishCallbacks::new().on_error(move |error| {
                assert!(matches!(error, SdkError::Protocol(ProtocolError::Network(_))));
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    assert!(matches!(
        handle.wait_settled().await,
        PublishState::Rejected { .. }
    ));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_ends_a_pending_publication() {
    let protocol = MemoryProtocol::new();
    protocol.set_challenge_policy(question());
    let client = open(&protocol).await;

    // Nobody answers the challenge.
    let handle = client
        .accounts()
        .publish_comment(hello(), None, PublishCallbacks::new())
        .await
        .unwrap();
    let mut states = handle.watch();
    states
        .wait_for(|state| matches!(state, PublishState::Challenged { attempt: 1 }))
        .await
        .unwrap();

    handle.stop();
    assert_eq!(handle.wait_settled().await, PublishState::Stopped);
    let accounts = client.accounts();
    wait_until("driver released", || accounts.pending_publications() == 0).await;
}

#[tokio::test]
async fn test_invalid_publications_fail_fast() {
    let protocol = MemoryProtocol::new();
    let client = open(&protocol).await;
    let accounts = client.accounts();

    let no_address = CommentOptions {
        subplebbit_address: String::new(),
        ..hello()
    };
    let no_body = CommentOptions {
        content: None,
        ..hello()
    };
    let half_reply = CommentOptions {
        parent_cid: Some("QmParent".to_string()),
        ..hello()
    };
    for options in [no_address, no_body, half_reply] {
        assert!(matches!(
            accounts
                .publish_comment(options, None, PublishCallbacks::new())
                .await,
            Err(SdkError::InvalidArgument(_))
        ));
    }
    assert!(matches!(
        accounts
            .publish_comment(hello(), Some("nobody"), PublishCallbacks::new())
            .await,
        Err(SdkError::AccountNotFound(_))
    ));
    assert!(accounts.account_comments(None).unwrap().is_empty());

    let bad_vote = VoteOptions {
        comment_cid: "QmA".to_string(),
        subplebbit_address: "news.eth".to_string(),
        vote: 2,
    };
    assert!(accounts
        .publish_vote(bad_vote, None, PublishCallbacks::new())
        .await
        .is_err());
}

#[tokio::test]
async fn test_latest_vote_wins() {
    let protocol = MemoryProtocol::new();
    let client = open(&protocol).await;
    let accounts = client.accounts();

    for vote in [1, -1, 0] {
        let handle = accounts
            .publish_vote(
                VoteOptions {
                    comment_cid: "QmA".to_string(),
                    subplebbit_address: "news.eth".to_string(),
                    vote,
                },
                None,
                PublishCallbacks::new(),
            )
            .await
            .unwrap();
        assert!(matches!(
            handle.wait_settled().await,
            PublishState::Verified { .. }
        ));
    }

    let votes = accounts.account_votes(None).unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes["QmA"].vote, 0);
}

#[tokio::test]
async fn test_created_subplebbit_grants_owner_role() {
    let protocol = MemoryProtocol::new();
    let client = open(&protocol).await;
    let account = client.accounts().active_account().unwrap();

    let subplebbit = client
        .subplebbits()
        .create_subplebbit(
            SubplebbitOptions {
                title: Some("Mine".to_string()),
                ..Default::default()
            },
            &account,
        )
        .await
        .unwrap();

    let accounts = client.accounts();
    wait_until("role derivation", || {
        accounts
            .active_account()
            .is_ok_and(|account| account.subplebbits.contains_key(&subplebbit.address))
    })
    .await;
    let owned = accounts.account_subplebbits(None).await.unwrap();
    assert_eq!(owned[&subplebbit.address].role.role, RoleKind::Owner);
}

#[tokio::test]
async fn test_accounts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let protocol = MemoryProtocol::new();

    let (account_id, cid) = {
        let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
        let client = open_with(&protocol, storage, fast_config()).await;
        let accounts = client.accounts();
        accounts.create_account(Some("alt")).await.unwrap();
        accounts.set_active_account("alt").await.unwrap();
        let handle = accounts
            .publish_comment(hello(), None, PublishCallbacks::new())
            .await
            .unwrap();
        let PublishState::Verified { cid: Some(cid) } = handle.wait_settled().await else {
            panic!("publication was not verified");
        };
        (accounts.active_account().unwrap().id, cid)
    };

    let storage = Arc::new(FileStorage::open(dir.path()).await.unwrap());
    let client = open_with(&protocol, storage, fast_config()).await;
    let accounts = client.accounts();
    let names: Vec<_> = accounts.accounts().into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["Account 1", "alt"]);
    assert_eq!(accounts.active_account().unwrap().id, account_id);
    assert_eq!(accounts.account_comment(&cid).unwrap().index, 0);
    // Tracking of confirmed comments resumes.
    assert_eq!(protocol.comment_subscriptions(&cid), 2);
}
