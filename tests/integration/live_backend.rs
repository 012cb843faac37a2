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

//! End-to-end tests against the development backend over real WebSockets.
//!
//! Each test starts an in-process `rentwire-backend` on an OS-assigned port
//! and drives two `SyncClient`s (a renter and an owner) through it.

use std::sync::Arc;
use std::time::Duration;

use rentwire::client::{SyncClient, SyncConfig};
use rentwire::connection::ConnectionConfig;
use rentwire::error::SyncError;
use rentwire::event::{ConnectionEvent, ConnectionState, DisconnectReason};
use rentwire::transport::Credential;
use rentwire::transport::ws::WsConnector;
use rentwire_backend::server::{self, BackendState};
use rentwire_proto::message::{ConversationId, MAX_MESSAGE_SIZE, UserId};

async fn start_backend() -> (String, Arc<BackendState>) {
    let state = Arc::new(BackendState::new());
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("failed to start backend");
    (format!("ws://{addr}/ws"), state)
}

async fn connect(url: &str, token: &str) -> SyncClient<WsConnector> {
    let config = SyncConfig {
        connection: ConnectionConfig {
            base_delay: Duration::from_millis(100),
            ..ConnectionConfig::default()
        },
        ..SyncConfig::default()
    };
    let client = SyncClient::new(WsConnector::new(url).unwrap(), config);
    client.connect(Credential::new(token)).await.unwrap();
    client
}

/// Polls `check` until it holds, failing the test after five seconds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Connects renter and owner and joins both to one listing conversation.
async fn pair(
    url: &str,
    state: &BackendState,
) -> (SyncClient<WsConnector>, SyncClient<WsConnector>, ConversationId) {
    let renter = connect(url, "renter").await;
    let owner = connect(url, "owner").await;
    let room = ConversationId::new("listing-42");
    renter.join(room.clone());
    owner.join(room.clone());

    let mut members = Vec::new();
    for _ in 0..250 {
        members = state.members(&room).await;
        if members.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(members, vec![UserId::new("owner"), UserId::new("renter")]);
    (renter, owner, room)
}

#[tokio::test]
async fn message_reaches_peer_and_echo_is_deduplicated() {
    let (url, state) = start_backend().await;
    let (renter, owner, room) = pair(&url, &state).await;

    let id = renter.send(&room, "Is the tent free this weekend?").unwrap();

    eventually("owner to receive the message", || owner.messages(&room).len() == 1).await;
    let received = &owner.messages(&room)[0];
    assert_eq!(received.id, id);
    assert_eq!(received.sender_id, UserId::new("renter"));

    // Give the echo time to arrive, then check it merged with the local copy.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let own = renter.messages(&room);
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].id, id);
    assert_eq!(own[0].sender_id, UserId::new("renter"));
}

#[tokio::test]
async fn escaped_content_over_the_frame_cap_never_blocks_the_queue() {
    let (url, state) = start_backend().await;
    let (renter, owner, room) = pair(&url, &state).await;

    let quotes = "\"".repeat(MAX_MESSAGE_SIZE);
    assert!(matches!(renter.send(&room, quotes), Err(SyncError::Codec(_))));

    renter.send(&room, "hello after").unwrap();
    renter.mark_read(&room);
    eventually("owner to receive the follow-up", || {
        owner.messages(&room).len() == 1
    })
    .await;
    assert_eq!(owner.messages(&room)[0].content, "hello after");
    eventually("renter queue to drain", || renter.pending_operations() == 0).await;
    assert_eq!(renter.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn typing_and_read_receipts_flow_both_ways() {
    let (url, state) = start_backend().await;
    let (renter, owner, room) = pair(&url, &state).await;

    owner.start_typing(&room);
    eventually("renter to see owner typing", || {
        renter.typing_users(&room) == vec![UserId::new("owner")]
    })
    .await;
    assert!(owner.typing_users(&room).is_empty(), "own typing is never listed");

    owner.stop_typing(&room);
    eventually("typing to clear", || renter.typing_users(&room).is_empty()).await;

    owner.send(&room, "Yes, pick up Friday after 5").unwrap();
    eventually("renter to receive", || renter.messages(&room).len() == 1).await;
    assert!(!renter.messages(&room)[0].is_read);

    renter.mark_read(&room);
    eventually("owner to see the receipt", || {
        owner.messages(&room).first().is_some_and(|m| m.is_read)
    })
    .await;
}

#[tokio::test]
async fn edits_are_applied_only_when_confirmed() {
    let (url, state) = start_backend().await;
    let (renter, owner, room) = pair(&url, &state).await;
    let mut owner_errors = owner.subscribe_connection();

    let id = renter.send(&room, "Pickup at 5").unwrap();
    eventually("owner to receive", || owner.messages(&room).len() == 1).await;

    // The owner cannot edit the renter's message.
    owner.edit(&id, "Pickup at 9").unwrap();
    let rejected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ConnectionEvent::ServerError { message }) = owner_errors.recv().await {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for the rejection");
    assert!(rejected.contains("sender"));

    renter.edit(&id, "Pickup at 6").unwrap();
    eventually("owner to see the edit", || {
        owner.messages(&room)[0].content == "Pickup at 6"
    })
    .await;
    assert!(owner.messages(&room)[0].is_edited);
    eventually("renter to see its own edit", || {
        renter.messages(&room)[0].is_edited
    })
    .await;
}

#[tokio::test]
async fn presence_follows_connections() {
    let (url, _state) = start_backend().await;
    let renter = connect(&url, "renter").await;
    let owner = connect(&url, "owner").await;

    eventually("renter to see owner online", || {
        renter.is_online(&UserId::new("owner"))
    })
    .await;

    owner.shutdown().await;
    eventually("renter to see owner offline", || {
        !renter.is_online(&UserId::new("owner"))
    })
    .await;
    assert!(renter.presence(&UserId::new("owner")).last_seen.is_some());
}

#[tokio::test]
async fn clients_rejoin_after_backend_drops_them() {
    let (url, state) = start_backend().await;
    let (renter, owner, room) = pair(&url, &state).await;
    let mut renter_events = renter.subscribe_connection();

    state.close_all_connections().await;
    let dropped = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(ConnectionEvent::Disconnected { reason }) = renter_events.recv().await {
                return reason;
            }
        }
    })
    .await
    .expect("timed out waiting for the drop");
    assert!(matches!(dropped, DisconnectReason::Transport(_)));

    eventually("both to reconnect", || {
        renter.state() == ConnectionState::Connected && owner.state() == ConnectionState::Connected
    })
    .await;

    // Membership on the backend is per connection, so this only works
    // because both clients rejoined on their own.
    let mut members = Vec::new();
    for _ in 0..250 {
        members = state.members(&room).await;
        if members.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(members.len(), 2);

    owner.send(&room, "Back online").unwrap();
    eventually("renter to receive after reconnect", || {
        renter.messages(&room).len() == 1
    })
    .await;
}
