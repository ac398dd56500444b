mod common;

use common::{open, post, seed_subplebbit, wait_until};
use plebsync_sdk::{CommentEvent, MemoryProtocol, SortType, SubplebbitEvent};

#[tokio::test]
async fn test_reset_drops_state_and_streams() {
    let protocol = MemoryProtocol::new();
    seed_subplebbit(&protocol, "news.eth", 1, 5);
    protocol.add_comment(post("news.eth", 0, "12D3KooWAuthor"));
    let client = open(&protocol).await;
    let account = client.accounts().active_account().unwrap();

    let cid = post("news.eth", 0, "").cid;
    client
        .comments()
        .add_comment_to_store(&cid, &account)
        .await
        .unwrap();
    let key = client
        .feeds()
        .add_feed_to_store(&account, ["news.eth"], SortType::New, false)
        .unwrap();
    let feeds = client.feeds();
    wait_until("feed", || {
        feeds.feed(&key).is_some_and(|feed| feed.loaded.len() == 5)
    })
    .await;

    client.reset().await.unwrap();
    assert!(client.comments().is_empty());
    assert!(client.pages().is_empty());
    assert!(client.subplebbits().get("news.eth").is_none());
    assert!(client.feeds().feed(&key).is_none());
    // Accounts come back from storage.
    assert_eq!(client.accounts().active_account().unwrap().id, account.id);

    // Updates of the old subscription no longer reach the store.
    let mut updated = post("news.eth", 0, "12D3KooWAuthor");
    updated.update.upvote_count = Some(10);
    protocol.update_comment(updated);
    tokio::task::yield_now().await;
    assert!(client.comments().get(&cid).is_none());

    // Entities can be requested again; the durable cache answers.
    client
        .comments()
        .add_comment_to_store(&cid, &account)
        .await
        .unwrap();
    assert!(client.comments().get(&cid).is_some());
    assert_eq!(protocol.comment_fetches(&cid), 1);
}

#[tokio::test]
async fn test_clear_caches_forces_refetch() {
    let protocol = MemoryProtocol::new();
    protocol.add_comment(post("news.eth", 0, "12D3KooWAuthor"));
    let client = open(&protocol).await;
    let account = client.accounts().active_account().unwrap();
    let cid = post("news.eth", 0, "").cid;

    client
        .comments()
        .add_comment_to_store(&cid, &account)
        .await
        .unwrap();
    client.reset().await.unwrap();
    client.clear_caches().await.unwrap();
    client
        .comments()
        .add_comment_to_store(&cid, &account)
        .await
        .unwrap();

    assert_eq!(protocol.comment_fetches(&cid), 2);
}

#[tokio::test]
async fn test_live_updates_flow_through_the_stores() {
    let protocol = MemoryProtocol::new();
    seed_subplebbit(&protocol, "news.eth", 1, 1);
    protocol.add_comment(post("news.eth", 0, "12D3KooWAuthor"));
    let client = open(&protocol).await;
    let account = client.accounts().active_account().unwrap();
    let mut comment_events = client.comments().subscribe();
    let mut subplebbit_events = client.subplebbits().subscribe();

    let cid = post("news.eth", 0, "").cid;
    client
        .comments()
        .add_comment_to_store(&cid, &account)
        .await
        .unwrap();
    client
        .subplebbits()
        .add_subplebbit_to_store("news.eth", &account)
        .await
        .unwrap();
    assert!(matches!(
        comment_events.recv().await.unwrap(),
        CommentEvent::Added(_)
    ));
    assert!(matches!(
        subplebbit_events.recv().await.unwrap(),
        SubplebbitEvent::Added(_)
    ));

    let mut update = post("news.eth", 0, "12D3KooWAuthor");
    update.update.reply_count = Some(4);
    protocol.update_comment(update);
    match comment_events.recv().await.unwrap() {
        CommentEvent::Updated(comment) => {
            assert_eq!(comment.update.reply_count, Some(4));
            assert_eq!(comment.content.title.as_deref(), Some("post 0"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let mut subplebbit = plebsync_sdk::Subplebbit::new("news.eth");
    subplebbit.title = Some("News".to_string());
    protocol.update_subplebbit(subplebbit);
    match subplebbit_events.recv().await.unwrap() {
        SubplebbitEvent::Updated(subplebbit) => {
            assert_eq!(subplebbit.title.as_deref(), Some("News"));
            // Entry points survive an update that omits them.
            assert!(subplebbit.posts.is_some());
        }
        other => panic!("unexpected event: {:?}", other),
    }
}
