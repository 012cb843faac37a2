// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items
)]

//! Integration tests for presence and typing indicators.
//!
//! Inbound notices are injected through the loopback backend and observed
//! through the `SyncClient` query surface and bus; outbound typing signals
//! are observed as dispatched operations.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use rentwire::client::{SyncClient, SyncConfig};
use rentwire::event::{SyncEvent, TypingEvent};
use rentwire::transport::Credential;
use rentwire::transport::loopback::{LoopbackBackend, LoopbackConnector};
use rentwire_proto::event::{ServerEvent, StatusChange, TypingNotice};
use rentwire_proto::message::{ConversationId, UserId};
use rentwire_proto::op::ClientOp;

async fn connected(backend: &LoopbackBackend) -> SyncClient<LoopbackConnector> {
    let client = SyncClient::new(backend.connector(), SyncConfig::default());
    client.connect(Credential::new("alice")).await.unwrap();
    client
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn typing(user: &str, room: &str) -> ServerEvent {
    ServerEvent::UserTyping(TypingNotice {
        user_id: UserId::new(user),
        conversation_id: ConversationId::new(room),
    })
}

fn status(user: &str, is_online: bool, last_seen: Option<i64>) -> ServerEvent {
    ServerEvent::UserStatusChanged(StatusChange {
        user_id: UserId::new(user),
        is_online,
        last_seen: last_seen.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
    })
}

#[tokio::test(start_paused = true)]
async fn remote_typing_expires_without_a_stop() {
    let backend = LoopbackBackend::new();
    let client = connected(&backend).await;
    let mut events = client.subscribe();
    let room = ConversationId::new("listing-5");

    backend.emit(typing("bob", "listing-5"));
    settle().await;
    assert_eq!(client.typing_users(&room), vec![UserId::new("bob")]);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(client.typing_users(&room), vec![UserId::new("bob")]);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(client.typing_users(&room).is_empty());

    let mut expired = Vec::new();
    while let Some(event) = events.try_recv() {
        if let SyncEvent::Typing(TypingEvent::Expired(notice)) = event {
            expired.push(notice.user_id);
        }
    }
    assert_eq!(expired, vec![UserId::new("bob")]);
}

#[tokio::test(start_paused = true)]
async fn stop_notice_clears_and_own_echo_is_hidden() {
    let backend = LoopbackBackend::new();
    let client = connected(&backend).await;
    let room = ConversationId::new("listing-5");

    backend.emit(typing("alice", "listing-5"));
    backend.emit(typing("carol", "listing-5"));
    backend.emit(typing("bob", "listing-5"));
    settle().await;
    assert_eq!(
        client.typing_users(&room),
        vec![UserId::new("bob"), UserId::new("carol")]
    );

    backend.emit(ServerEvent::UserStoppedTyping(TypingNotice {
        user_id: UserId::new("carol"),
        conversation_id: room.clone(),
    }));
    settle().await;
    assert_eq!(client.typing_users(&room), vec![UserId::new("bob")]);
}

#[tokio::test(start_paused = true)]
async fn leaving_a_room_forgets_its_typists() {
    let backend = LoopbackBackend::new();
    let client = connected(&backend).await;
    let room = ConversationId::new("listing-6");
    client.join(room.clone());

    backend.emit(typing("bob", "listing-6"));
    settle().await;
    assert_eq!(client.typing_users(&room).len(), 1);

    client.leave(&room);
    assert!(client.typing_users(&room).is_empty());
}

#[tokio::test(start_paused = true)]
async fn outbound_typing_is_debounced_and_auto_stops() {
    let backend = LoopbackBackend::new();
    let client = connected(&backend).await;
    let room = ConversationId::new("listing-7");

    client.start_typing(&room);
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.start_typing(&room);
    tokio::time::sleep(Duration::from_secs(1)).await;
    client.start_typing(&room);
    settle().await;
    assert_eq!(backend.dispatched(), vec![ClientOp::TypingStart(room.clone())]);

    // Three seconds after the last keystroke the stop goes out on its own.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(backend.dispatched(), vec![
        ClientOp::TypingStart(room.clone()),
        ClientOp::TypingStop(room.clone()),
    ]);

    // A later stop has nothing to cancel.
    client.stop_typing(&room);
    settle().await;
    assert_eq!(backend.dispatched().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn presence_tracks_the_latest_notice() {
    let backend = LoopbackBackend::new();
    let client = connected(&backend).await;
    let bob = UserId::new("bob");

    assert!(!client.is_online(&bob));

    backend.emit(status("bob", true, None));
    backend.emit(status("dave", true, None));
    settle().await;
    assert!(client.is_online(&bob));
    assert_eq!(client.online_users(), vec![bob.clone(), UserId::new("dave")]);

    backend.emit(status("bob", false, Some(1_760_000_000)));
    settle().await;
    let entry = client.presence(&bob);
    assert!(!entry.is_online);
    assert_eq!(entry.last_seen, Utc.timestamp_opt(1_760_000_000, 0).single());
    assert_eq!(client.online_users(), vec![UserId::new("dave")]);
}
