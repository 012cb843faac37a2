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

//! Integration tests for automatic reconnection.
//!
//! Drives a full `SyncClient` against the loopback backend and checks what
//! the backend sees across a dropped session:
//! - every joined room is rejoined before anything else is dispatched
//! - operations queued while reconnecting flush after the rejoin
//! - left rooms are not rejoined
//! - exhausting the retries leaves the client errored until `connect`

use std::time::Duration;

use rentwire::client::{SyncClient, SyncConfig};
use rentwire::event::{ConnectionEvent, ConnectionState};
use rentwire::transport::Credential;
use rentwire::transport::loopback::{ConnectOutcome, LoopbackBackend, LoopbackConnector};
use rentwire_proto::message::ConversationId;
use rentwire_proto::op::{ClientOp, OperationKind};

fn client(backend: &LoopbackBackend) -> SyncClient<LoopbackConnector> {
    SyncClient::new(backend.connector(), SyncConfig::default())
}

/// Lets spawned tasks run without advancing past any backoff delay.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

fn joins(ops: &[ClientOp]) -> Vec<ConversationId> {
    ops.iter()
        .filter_map(|op| match op {
            ClientOp::JoinConversation(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn rooms_are_rejoined_after_a_drop() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();

    let r1 = ConversationId::new("r1");
    let r2 = ConversationId::new("r2");
    client.join(r2.clone());
    client.join(r1.clone());
    settle().await;
    assert_eq!(joins(&backend.dispatched()), vec![r2.clone(), r1.clone()]);
    backend.clear_dispatched();

    backend.sever();
    settle().await;
    assert_eq!(client.state(), ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(backend.dispatched(), vec![
        ClientOp::JoinConversation(r1),
        ClientOp::JoinConversation(r2),
    ]);
}

#[tokio::test(start_paused = true)]
async fn operations_queued_while_reconnecting_follow_the_rejoin() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();
    let room = ConversationId::new("listing-9");
    client.join(room.clone());
    settle().await;
    backend.clear_dispatched();

    backend.sever();
    settle().await;
    client.send(&room, "still there?").unwrap();
    client.mark_read(&room);
    assert_eq!(client.pending_operations(), 2);

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let kinds: Vec<OperationKind> = backend.dispatched().iter().map(ClientOp::kind).collect();
    assert_eq!(kinds, vec![
        OperationKind::JoinRoom,
        OperationKind::SendMessage,
        OperationKind::MarkRead,
    ]);
    assert_eq!(client.pending_operations(), 0);
}

#[tokio::test(start_paused = true)]
async fn left_rooms_are_not_rejoined() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();
    client.join(ConversationId::new("keep"));
    client.join(ConversationId::new("drop"));
    client.leave(&ConversationId::new("drop"));
    settle().await;
    backend.clear_dispatched();

    backend.sever();
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(joins(&backend.dispatched()), vec![ConversationId::new("keep")]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_leave_client_errored() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    let mut connection = client.subscribe_connection();
    client.connect(Credential::new("alice")).await.unwrap();
    client.join(ConversationId::new("r1"));
    settle().await;

    backend.script(std::iter::repeat_n(ConnectOutcome::Refuse, 5));
    backend.sever();

    // 1 + 2 + 3 + 4 + 5 seconds of backoff.
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert_eq!(client.state(), ConnectionState::Errored);
    assert_eq!(backend.connect_attempts(), 6);

    let mut failed = None;
    while let Some(event) = connection.try_recv() {
        if let ConnectionEvent::ReconnectionFailed { attempts } = event {
            failed = Some(attempts);
        }
    }
    assert_eq!(failed, Some(5));

    // Nothing retries on its own after giving up.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.connect_attempts(), 6);

    // A manual connect restores the session and its rooms.
    backend.clear_dispatched();
    client.connect(Credential::new("alice")).await.unwrap();
    settle().await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(joins(&backend.dispatched()), vec![ConversationId::new("r1")]);
}

#[tokio::test(start_paused = true)]
async fn manual_disconnect_stops_reconnecting() {
    let backend = LoopbackBackend::new();
    let client = client(&backend);
    client.connect(Credential::new("alice")).await.unwrap();

    backend.sever();
    settle().await;
    client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(backend.connect_attempts(), 1);
}
