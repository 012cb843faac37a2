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

//! Integration tests for offline operation queueing.
//!
//! Verifies that operations issued while disconnected are visible locally,
//! held in order, and flushed in FIFO order once a session is up, and that
//! a failed dispatch never reorders or loses what is queued.

use std::time::Duration;

use rentwire::client::{SyncClient, SyncConfig};
use rentwire::queue::RETRY_DELAY;
use rentwire::transport::Credential;
use rentwire::transport::loopback::{LoopbackBackend, LoopbackConnector};
use rentwire_proto::message::{ConversationId, MessageId};
use rentwire_proto::op::ClientOp;

fn client(backend: &LoopbackBackend) -> SyncClient<LoopbackConnector> {
    SyncClient::new(backend.connector(), SyncConfig::default())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Contents of every `send_message` the backend received, in order.
fn sent_contents(ops: &[ClientOp]) -> Vec<String> {
    ops.iter()
        .filter_map(|op| match op {
            ClientOp::SendMessage(send) => Some(send.content.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn offline_sends_flush_in_order_after_connect() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    let room = ConversationId::new("listing-3");

    for body in ["A", "B", "C"] {
        client.send(&room, body).unwrap();
    }
    assert_eq!(client.messages(&room).len(), 3);
    assert_eq!(client.pending_operations(), 3);
    assert!(backend.dispatched().is_empty());

    client.connect(Credential::new("alice")).await.unwrap();
    settle().await;

    assert_eq!(sent_contents(&backend.dispatched()), vec!["A", "B", "C"]);
    assert_eq!(client.pending_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_dispatch_keeps_order_for_next_flush() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();
    let room = ConversationId::new("listing-3");

    // One failure per wakeup the three sends can leave behind.
    backend.fail_next_sends(2);
    for body in ["A", "B", "C"] {
        client.send(&room, body).unwrap();
    }
    settle().await;

    // Dispatch failed; nothing went out and nothing moved.
    assert!(backend.dispatched().is_empty());
    assert_eq!(client.pending_operations(), 3);

    // The flusher retries from the front on its own.
    tokio::time::sleep(RETRY_DELAY + Duration::from_millis(10)).await;
    assert_eq!(sent_contents(&backend.dispatched()), vec!["A", "B", "C"]);
    assert_eq!(client.pending_operations(), 0);

    client.send(&room, "D").unwrap();
    settle().await;
    assert_eq!(sent_contents(&backend.dispatched()), vec!["A", "B", "C", "D"]);
}

#[tokio::test(start_paused = true)]
async fn queue_survives_a_drop_mid_session() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();
    let room = ConversationId::new("listing-3");
    client.join(room.clone());
    settle().await;

    backend.sever();
    settle().await;
    client.send(&room, "A").unwrap();
    client.send(&room, "B").unwrap();
    assert_eq!(client.pending_operations(), 2);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(sent_contents(&backend.dispatched()), vec!["A", "B"]);
}

#[tokio::test(start_paused = true)]
async fn leaving_purges_that_conversation_only() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    let gone = ConversationId::new("gone");
    let kept = ConversationId::new("kept");

    client.join(gone.clone());
    client.join(kept.clone());
    client.send(&gone, "never sent").unwrap();
    client.send(&kept, "sent").unwrap();
    client.edit(&MessageId::new("m-1"), "edits have no room").unwrap();

    client.leave(&gone);

    client.connect(Credential::new("alice")).await.unwrap();
    settle().await;
    let pending_rooms: Vec<Option<ConversationId>> = backend
        .dispatched()
        .iter()
        .map(|op| op.conversation_id().cloned())
        .collect();

    // The leave itself is sent; nothing else for the left room is.
    let gone_ops: Vec<ClientOp> = backend
        .dispatched()
        .into_iter()
        .filter(|op| op.conversation_id() == Some(&gone))
        .collect();
    assert_eq!(gone_ops, vec![ClientOp::LeaveConversation(gone.clone())]);
    assert!(pending_rooms.contains(&Some(kept)));
    assert!(pending_rooms.contains(&None), "edit is still dispatched");
    assert_eq!(sent_contents(&backend.dispatched()), vec!["sent"]);
}

#[tokio::test(start_paused = true)]
async fn backend_echo_does_not_duplicate_optimistic_copy() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();
    let room = ConversationId::new("listing-3");
    client.join(room.clone());

    let id = client.send(&room, "hello").unwrap();
    settle().await;

    let mut echo = client.messages(&room)[0].clone();
    echo.content = "hello".into();
    backend.emit(rentwire_proto::event::ServerEvent::NewMessage(echo));
    settle().await;

    let messages = client.messages(&room);
    assert_eq!(messages.len(), 1, "echo with the same id is not duplicated");
    assert_eq!(messages[0].id, id);
}
