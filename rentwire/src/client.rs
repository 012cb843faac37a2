//! [`SyncClient`]: one wired-up instance of every engine component.
//!
//! The client owns the bus, the connection, the outbound queue and the
//! state stores, registers the stores as bus handlers, and runs the queue
//! flusher and the typing sweeper in the background.
//!
//! ```rust,no_run
//! use rentwire::client::{SyncClient, SyncConfig};
//! use rentwire::transport::Credential;
//! use rentwire::transport::ws::WsConnector;
//! use rentwire_proto::message::ConversationId;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = WsConnector::new("ws://127.0.0.1:9000/ws")?;
//! let client = SyncClient::new(connector, SyncConfig::default());
//! client.connect(Credential::new("alice")).await?;
//!
//! let room = ConversationId::new("listing-42");
//! client.join(room.clone());
//! client.send(&room, "Is the bike still available?")?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use rentwire_proto::codec;
use rentwire_proto::message::{
    ConversationId, Message, MessageId, MessageType, UserId, validate_content,
};
use rentwire_proto::op::{ClientOp, EditMessage, SendMessage};

use crate::bus::{DEFAULT_BUS_CAPACITY, EventBus, Filtered, Subscription};
use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::SyncError;
use crate::event::{ConnectionEvent, ConnectionState, MessageEvent, SyncEvent};
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::queue::{OutboundQueue, spawn_flusher};
use crate::reconcile::{MessageReconciler, PROVISIONAL_SENDER};
use crate::rooms::RoomMembership;
use crate::transport::{Connector, Credential};
use crate::typing::{TypingConfig, TypingCoordinator, spawn_sweeper};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Connect and reconnect timings.
    pub connection: ConnectionConfig,
    /// Typing timings.
    pub typing: TypingConfig,
    /// Events buffered per bus subscriber.
    pub bus_capacity: usize,
    /// Local user id, if known before the first session.
    pub local_user: Option<UserId>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            typing: TypingConfig::default(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
            local_user: None,
        }
    }
}

/// The consumer-facing synchronization engine.
pub struct SyncClient<C: Connector> {
    bus: EventBus,
    connection: ConnectionManager<C>,
    queue: Arc<OutboundQueue>,
    rooms: Arc<RoomMembership>,
    typing: Arc<TypingCoordinator>,
    presence: Arc<PresenceRegistry>,
    reconciler: Arc<MessageReconciler>,
    local_user: Option<UserId>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Connector> SyncClient<C> {
    /// Builds and wires every component. Must be called from within a tokio
    /// runtime.
    pub fn new(connector: C, config: SyncConfig) -> Self {
        let bus = EventBus::new(config.bus_capacity);
        let queue = Arc::new(OutboundQueue::new());
        let connection = ConnectionManager::new(connector, bus.clone(), config.connection);

        let rooms = Arc::new(RoomMembership::new(Arc::clone(&queue), bus.clone()));
        let typing = Arc::new(TypingCoordinator::new(config.typing, Arc::clone(&queue)));
        let presence = Arc::new(PresenceRegistry::new());
        let reconciler = Arc::new(MessageReconciler::new());

        if let Some(user) = &config.local_user {
            typing.set_local_user(user.clone());
        }

        connection.add_session_listener(rooms.clone());
        bus.register(typing.clone());
        bus.register(presence.clone());
        bus.register(reconciler.clone());

        let flusher = spawn_flusher(
            Arc::clone(&queue),
            Arc::new(connection.clone()),
            connection.watch_state(),
            bus.clone(),
        );
        let sweeper = spawn_sweeper(Arc::clone(&typing), bus.clone());

        Self {
            bus,
            connection,
            queue,
            rooms,
            typing,
            presence,
            reconciler,
            local_user: config.local_user,
            tasks: Mutex::new(vec![flusher, sweeper]),
        }
    }

    // ---------------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------------

    /// Connects and authenticates. See [`ConnectionManager::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the attempt fails or is refused.
    pub async fn connect(&self, credential: Credential) -> Result<(), SyncError> {
        self.connection.connect(credential).await
    }

    /// Disconnects. Joined rooms and queued operations are kept for the
    /// next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Disconnects and drops all state: rooms, queued operations, typing
    /// timers and entries, presence and message lists. Background tasks
    /// stop.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.rooms.clear();
        self.queue.clear();
        self.typing.clear();
        self.presence.clear();
        self.reconciler.clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("sync client shut down");
    }

    // ---------------------------------------------------------------------
    // Rooms
    // ---------------------------------------------------------------------

    /// Joins a conversation room.
    pub fn join(&self, conversation: ConversationId) {
        self.rooms.join(conversation);
    }

    /// Leaves a conversation room.
    pub fn leave(&self, conversation: &ConversationId) {
        self.rooms.leave(conversation);
    }

    /// Rooms the client is joined to.
    #[must_use]
    pub fn rooms(&self) -> Vec<ConversationId> {
        self.rooms.rooms()
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Sends a text message. The message shows up in
    /// [`messages`](Self::messages) immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for empty or oversized content.
    pub fn send(
        &self,
        conversation: &ConversationId,
        content: impl Into<String>,
    ) -> Result<MessageId, SyncError> {
        self.send_with(conversation, content, MessageType::Text, None)
    }

    /// Sends a message of any kind, optionally as a reply.
    ///
    /// Before the first session the optimistic copy carries
    /// [`PROVISIONAL_SENDER`] unless a local user is configured; it is
    /// re-attributed once the backend names the user.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for empty or oversized content and
    /// [`SyncError::Codec`] when the operation would not fit in one frame.
    pub fn send_with(
        &self,
        conversation: &ConversationId,
        content: impl Into<String>,
        kind: MessageType,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, SyncError> {
        let content = content.into();
        validate_content(&content)?;

        let id = MessageId::generate();
        let op = ClientOp::SendMessage(SendMessage {
            conversation_id: conversation.clone(),
            content: content.clone(),
            kind,
            reply_to_id: reply_to.clone(),
            message_id: Some(id.clone()),
        });
        codec::encode(&op)?;

        let sender_id = self
            .local_user()
            .unwrap_or_else(|| UserId::new(PROVISIONAL_SENDER));
        let provisional = Message {
            id: id.clone(),
            conversation_id: conversation.clone(),
            sender_id,
            content,
            kind,
            created_at: Utc::now(),
            is_edited: false,
            is_read: false,
            reply_to_id: reply_to,
        };
        self.reconciler.insert_local(provisional, &self.bus);
        self.queue.enqueue_or_send(op);
        Ok(id)
    }

    /// Requests an edit. The local copy changes when the backend confirms
    /// with `message_edited`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] for empty or oversized content and
    /// [`SyncError::Codec`] when the operation would not fit in one frame.
    pub fn edit(&self, message: &MessageId, new_content: impl Into<String>) -> Result<(), SyncError> {
        let new_content = new_content.into();
        validate_content(&new_content)?;
        let op = ClientOp::EditMessage(EditMessage {
            message_id: message.clone(),
            new_content,
        });
        codec::encode(&op)?;
        self.queue.enqueue_or_send(op);
        Ok(())
    }

    /// Marks the conversation read for the local user.
    pub fn mark_read(&self, conversation: &ConversationId) {
        self.queue
            .enqueue_or_send(ClientOp::MarkMessagesRead(conversation.clone()));
    }

    /// Reconciled messages of a conversation, oldest first.
    #[must_use]
    pub fn messages(&self, conversation: &ConversationId) -> Vec<Message> {
        self.reconciler.messages(conversation)
    }

    /// Merges a history page fetched out of band. Returns how many
    /// messages were new.
    pub fn merge_page(&self, conversation: &ConversationId, page: Vec<Message>) -> usize {
        self.reconciler.merge_page(conversation, page, &self.bus)
    }

    /// Drops a message whose deletion the backend acknowledged.
    pub fn acknowledge_delete(&self, conversation: &ConversationId, message: &MessageId) -> bool {
        self.reconciler.remove(conversation, message, &self.bus)
    }

    /// Edits dropped because their message was not loaded.
    #[must_use]
    pub fn discarded_edits(&self) -> u64 {
        self.reconciler.discarded()
    }

    /// Operations waiting for a connection.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    // ---------------------------------------------------------------------
    // Typing & presence
    // ---------------------------------------------------------------------

    /// The local user is typing in `conversation`.
    pub fn start_typing(&self, conversation: &ConversationId) {
        self.typing.start_typing(conversation);
    }

    /// The local user stopped typing in `conversation`.
    pub fn stop_typing(&self, conversation: &ConversationId) {
        self.typing.stop_typing(conversation);
    }

    /// Other users typing in `conversation`.
    #[must_use]
    pub fn typing_users(&self, conversation: &ConversationId) -> Vec<UserId> {
        self.typing.typing_users(conversation)
    }

    /// Whether `user` is online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.presence.is_online(user)
    }

    /// `user`'s last known status.
    #[must_use]
    pub fn presence(&self, user: &UserId) -> PresenceEntry {
        self.presence.status(user)
    }

    /// Users known to be online.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    /// The authenticated user, or the configured one before any session.
    #[must_use]
    pub fn local_user(&self) -> Option<UserId> {
        self.connection
            .user_id()
            .or_else(|| self.local_user.clone())
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Every bus event.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Message traffic and list changes only.
    #[must_use]
    pub fn subscribe_messages(&self) -> Filtered<MessageEvent> {
        self.bus.subscribe().filter_map(|event| match event {
            SyncEvent::Message(event) => Some(event),
            _ => None,
        })
    }

    /// Connection lifecycle only.
    #[must_use]
    pub fn subscribe_connection(&self) -> Filtered<ConnectionEvent> {
        self.bus.subscribe().filter_map(|event| match event {
            SyncEvent::Connection(event) => Some(event),
            _ => None,
        })
    }

    /// The bus itself, for registering extra handlers.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }
}

impl<C: Connector> Drop for SyncClient<C> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
