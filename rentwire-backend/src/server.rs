//! Backend server core: shared state, WebSocket handler, room registry, and
//! event fan-out.
//!
//! Every connection must authenticate with its first frame. After that the
//! server tracks which conversation rooms the user joined and fans events out
//! to room members: new messages go to everyone in the room (sender
//! included), typing notices and membership changes go to everyone else.
//! Presence changes are broadcast to all connected users.
//!
//! Room membership is per connection: a user who disconnects leaves every
//! room and must rejoin after reconnecting.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as Frame, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rentwire_proto::codec;
use rentwire_proto::event::{
    ErrorPayload, Membership, ReadReceipt, ServerEvent, SessionInfo, StatusChange, TypingNotice,
};
use rentwire_proto::message::{ConversationId, Message, MessageId, UserId, validate_content};
use rentwire_proto::op::{ClientOp, EditMessage, Handshake, SendMessage};
use tokio::sync::{RwLock, mpsc};

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// How long a new socket may take to send `authenticate`.
    pub auth_timeout: Duration,
    /// Largest WebSocket message accepted from a client.
    pub max_frame_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            max_frame_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// A live, authenticated connection.
struct Peer {
    /// Distinguishes a reconnect from the connection it replaced.
    connection: u64,
    /// Channel feeding the connection's WebSocket writer task.
    sender: mpsc::UnboundedSender<Frame>,
}

/// Outcome of the authentication frame.
enum Admission {
    /// The token was accepted; the user id is the token itself.
    Accepted(UserId),
    /// The token was refused; the reason is sent back in `connect_error`.
    Rejected(String),
    /// The socket closed or sent garbage before authenticating.
    Gone,
}

/// Shared backend state holding connections, rooms, and message history.
pub struct BackendState {
    /// Maps each online user to its connection.
    connections: RwLock<HashMap<UserId, Peer>>,
    /// Members of each conversation room.
    rooms: RwLock<HashMap<ConversationId, HashSet<UserId>>>,
    /// Every message posted since startup, for edits and read receipts.
    messages: RwLock<HashMap<MessageId, Message>>,
    /// Tokens accepted by the handshake. `None` accepts any well-formed token.
    allowed_tokens: Option<HashSet<String>>,
    settings: ServerSettings,
    next_connection: AtomicU64,
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    /// Creates a state that accepts any non-empty token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            allowed_tokens: None,
            settings: ServerSettings::default(),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Creates a state that only accepts the given tokens.
    #[must_use]
    pub fn with_allowed_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            allowed_tokens: Some(tokens.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    /// Replaces the per-connection limits.
    #[must_use]
    pub fn with_settings(mut self, settings: ServerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Per-connection limits in effect.
    #[must_use]
    pub const fn settings(&self) -> ServerSettings {
        self.settings
    }

    fn authenticate(&self, token: &str) -> Admission {
        if token.is_empty() {
            return Admission::Rejected("token is empty".to_string());
        }
        if let Some(allowed) = &self.allowed_tokens
            && !allowed.contains(token)
        {
            return Admission::Rejected("invalid token".to_string());
        }
        Admission::Accepted(UserId::new(token))
    }

    /// Registers a user's connection, returning its connection number.
    ///
    /// If the user was already connected, the old connection is replaced and
    /// its writer task shuts down once the old sender is dropped.
    async fn register(&self, user: &UserId, sender: mpsc::UnboundedSender<Frame>) -> u64 {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.connections.write().await;
        if conns.insert(user.clone(), Peer { connection, sender }).is_some() {
            tracing::info!(user_id = %user, "replaced existing connection");
        }
        connection
    }

    /// Removes a user's connection if it is still the current one.
    async fn unregister(&self, user: &UserId, connection: u64) -> bool {
        let mut conns = self.connections.write().await;
        if conns.get(user).is_some_and(|peer| peer.connection == connection) {
            conns.remove(user);
            return true;
        }
        false
    }

    /// Whether `user` has a live connection.
    pub async fn is_online(&self, user: &UserId) -> bool {
        self.connections.read().await.contains_key(user)
    }

    /// Members of a conversation room, sorted.
    pub async fn members(&self, conversation: &ConversationId) -> Vec<UserId> {
        let mut members: Vec<UserId> = self
            .rooms
            .read()
            .await
            .get(conversation)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of messages posted since startup.
    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Send a WebSocket Close frame to every connected user.
    ///
    /// Each client sees its link drop, which is how tests simulate a backend
    /// outage.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (user, peer) in conns.iter() {
            tracing::info!(user_id = %user, "sending close frame");
            let _ = peer.sender.send(Frame::Close(None));
        }
    }

    async fn send_to(&self, user: &UserId, event: &ServerEvent) {
        let Some(frame) = encode_frame(event) else {
            return;
        };
        if let Some(peer) = self.connections.read().await.get(user) {
            let _ = peer.sender.send(frame);
        }
    }

    /// Sends `event` to every member of `conversation` except `skip`.
    async fn broadcast_room(
        &self,
        conversation: &ConversationId,
        event: &ServerEvent,
        skip: Option<&UserId>,
    ) {
        let Some(frame) = encode_frame(event) else {
            return;
        };
        let members = self.members(conversation).await;
        let conns = self.connections.read().await;
        for member in members.iter().filter(|m| Some(*m) != skip) {
            if let Some(peer) = conns.get(member) {
                let _ = peer.sender.send(frame.clone());
            }
        }
    }

    /// Sends `event` to every connected user except `skip`.
    async fn broadcast_all(&self, event: &ServerEvent, skip: &UserId) {
        let Some(frame) = encode_frame(event) else {
            return;
        };
        let conns = self.connections.read().await;
        for (user, peer) in conns.iter().filter(|(user, _)| *user != skip) {
            tracing::trace!(user_id = %user, "broadcasting");
            let _ = peer.sender.send(frame.clone());
        }
    }

    /// Drops `user` from every room, returning the rooms it was in.
    async fn leave_all(&self, user: &UserId) -> Vec<ConversationId> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        for (conversation, members) in rooms.iter_mut() {
            if members.remove(user) {
                left.push(conversation.clone());
            }
        }
        rooms.retain(|_, members| !members.is_empty());
        left
    }
}

/// Handles an upgraded WebSocket connection for a single user.
///
/// The connection lifecycle:
/// 1. Wait for an `authenticate` frame, up to the configured auth timeout.
/// 2. Reply `authenticated`, or `connect_error` and close.
/// 3. Register the user and announce them online.
/// 4. Enter the operation loop, fanning events out to room members.
/// 5. On disconnect, drop room memberships and announce them offline.
pub async fn handle_socket(socket: WebSocket, state: Arc<BackendState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let admission = tokio::time::timeout(
        state.settings.auth_timeout,
        wait_for_authenticate(&mut ws_receiver, &state),
    )
    .await
    .unwrap_or_else(|_| Admission::Rejected("authentication timed out".to_string()));

    let user_id = match admission {
        Admission::Accepted(user_id) => user_id,
        Admission::Rejected(reason) => {
            tracing::warn!(reason = %reason, "authentication rejected");
            let refusal = ServerEvent::ConnectError(ErrorPayload { message: reason });
            if let Some(frame) = encode_frame(&refusal) {
                let _ = ws_sender.send(frame).await;
            }
            let _ = ws_sender.send(Frame::Close(None)).await;
            return;
        }
        Admission::Gone => {
            tracing::warn!("connection closed before authentication");
            return;
        }
    };

    let ack = ServerEvent::Authenticated(SessionInfo {
        user_id: user_id.clone(),
    });
    let Some(ack) = encode_frame(&ack) else {
        return;
    };
    if let Err(e) = ws_sender.send(ack).await {
        tracing::error!(user_id = %user_id, error = %e, "failed to send authenticated ack");
        return;
    }

    // Create a channel for sending frames to this user's WebSocket writer.
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let connection = state.register(&user_id, tx).await;
    tracing::info!(user_id = %user_id, connection, "user connected");

    let online = ServerEvent::UserStatusChanged(StatusChange {
        user_id: user_id.clone(),
        is_online: true,
        last_seen: None,
    });
    state.broadcast_all(&online, &user_id).await;

    // Spawn a writer task that forwards frames from the channel to the WebSocket.
    let writer_user = user_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let closing = matches!(frame, Frame::Close(_));
            if ws_sender.send(frame).await.is_err() {
                tracing::warn!(user_id = %writer_user, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader loop: process operations from this user.
    let reader_user = user_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = ws_receiver.next().await {
            match frame {
                Frame::Text(text) => {
                    handle_text_frame(&reader_user, text.as_str(), &reader_state).await;
                }
                Frame::Close(_) => {
                    tracing::info!(user_id = %reader_user, "received close frame");
                    break;
                }
                _ => {
                    // Ignore binary, ping, pong frames.
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    // A replaced connection must not tear down its successor's state.
    if state.unregister(&user_id, connection).await {
        let rooms = state.leave_all(&user_id).await;
        for conversation in rooms {
            let left = ServerEvent::UserLeft(Membership {
                conversation_id: conversation.clone(),
                user_id: user_id.clone(),
            });
            state.broadcast_room(&conversation, &left, Some(&user_id)).await;
        }
        let offline = ServerEvent::UserStatusChanged(StatusChange {
            user_id: user_id.clone(),
            is_online: false,
            last_seen: Some(Utc::now()),
        });
        state.broadcast_all(&offline, &user_id).await;
    }
    tracing::info!(user_id = %user_id, "user disconnected");
}

/// Waits for the first text frame, expecting `authenticate`.
async fn wait_for_authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Frame, axum::Error>> + Unpin),
    state: &BackendState,
) -> Admission {
    while let Some(Ok(frame)) = receiver.next().await {
        match frame {
            Frame::Text(text) => {
                return match codec::decode::<Handshake>(text.as_str()) {
                    Ok(Handshake::Authenticate { token }) => state.authenticate(&token),
                    Err(e) => {
                        tracing::warn!(error = %e, "expected authenticate frame");
                        Admission::Rejected("authentication required".to_string())
                    }
                };
            }
            Frame::Close(_) => return Admission::Gone,
            _ => {
                // Skip ping/pong during the handshake.
            }
        }
    }
    Admission::Gone
}

/// Handles a text frame from an authenticated user.
async fn handle_text_frame(user: &UserId, text: &str, state: &Arc<BackendState>) {
    let op = match codec::decode::<ClientOp>(text) {
        Ok(op) => op,
        Err(e) => {
            tracing::warn!(user_id = %user, error = %e, "failed to decode operation");
            reply_error(state, user, format!("malformed operation: {e}")).await;
            return;
        }
    };
    tracing::debug!(user_id = %user, op = %op, "operation received");

    match op {
        ClientOp::JoinConversation(conversation) => {
            let newly_joined = state
                .rooms
                .write()
                .await
                .entry(conversation.clone())
                .or_default()
                .insert(user.clone());
            if newly_joined {
                let joined = ServerEvent::UserJoined(Membership {
                    conversation_id: conversation.clone(),
                    user_id: user.clone(),
                });
                state.broadcast_room(&conversation, &joined, Some(user)).await;
            }
        }
        ClientOp::LeaveConversation(conversation) => {
            let was_member = {
                let mut rooms = state.rooms.write().await;
                let removed = rooms
                    .get_mut(&conversation)
                    .is_some_and(|members| members.remove(user));
                rooms.retain(|_, members| !members.is_empty());
                removed
            };
            if was_member {
                let left = ServerEvent::UserLeft(Membership {
                    conversation_id: conversation.clone(),
                    user_id: user.clone(),
                });
                state.broadcast_room(&conversation, &left, Some(user)).await;
            }
        }
        ClientOp::SendMessage(send) => handle_send(user, send, state).await,
        ClientOp::EditMessage(edit) => handle_edit(user, edit, state).await,
        ClientOp::MarkMessagesRead(conversation) => {
            let count = {
                let mut messages = state.messages.write().await;
                let mut count = 0;
                for message in messages.values_mut().filter(|m| {
                    m.conversation_id == conversation && m.sender_id != *user && !m.is_read
                }) {
                    message.is_read = true;
                    count += 1;
                }
                count
            };
            tracing::debug!(user_id = %user, conversation_id = %conversation, count, "marked read");
            let receipt = ServerEvent::MessagesRead(ReadReceipt {
                conversation_id: conversation.clone(),
                read_by: user.clone(),
            });
            state.broadcast_room(&conversation, &receipt, None).await;
        }
        ClientOp::TypingStart(conversation) => {
            let notice = ServerEvent::UserTyping(TypingNotice {
                user_id: user.clone(),
                conversation_id: conversation.clone(),
            });
            state.broadcast_room(&conversation, &notice, Some(user)).await;
        }
        ClientOp::TypingStop(conversation) => {
            let notice = ServerEvent::UserStoppedTyping(TypingNotice {
                user_id: user.clone(),
                conversation_id: conversation.clone(),
            });
            state.broadcast_room(&conversation, &notice, Some(user)).await;
        }
    }
}

/// How a client-supplied message id relates to what is stored.
enum Claim {
    /// Unused id: store and deliver.
    Fresh(Message),
    /// The sender is resending its own message: deliver the stored copy.
    Resent(Message),
    /// The id belongs to another sender or conversation.
    Taken,
}

/// Stores a new message and delivers it to the whole room.
///
/// A client-supplied message id is kept so the sender can match the echo to
/// its optimistic copy; otherwise a fresh id is minted. An id already held
/// by another sender or conversation is refused and never overwritten.
async fn handle_send(user: &UserId, send: SendMessage, state: &Arc<BackendState>) {
    if let Err(e) = validate_content(&send.content) {
        reply_error(state, user, e.to_string()).await;
        return;
    }
    let is_member = state
        .rooms
        .read()
        .await
        .get(&send.conversation_id)
        .is_some_and(|members| members.contains(user));
    if !is_member {
        reply_error(
            state,
            user,
            format!("not a member of conversation {}", send.conversation_id),
        )
        .await;
        return;
    }

    let message = Message {
        id: send.message_id.unwrap_or_else(MessageId::generate),
        conversation_id: send.conversation_id,
        sender_id: user.clone(),
        content: send.content,
        kind: send.kind,
        created_at: Utc::now(),
        is_edited: false,
        is_read: false,
        reply_to_id: send.reply_to_id,
    };
    tracing::debug!(
        user_id = %user,
        message_id = %message.id,
        conversation_id = %message.conversation_id,
        "message posted"
    );

    let id = message.id.clone();
    let claim = {
        let mut messages = state.messages.write().await;
        match messages.get(&id) {
            None => {
                messages.insert(id.clone(), message.clone());
                Claim::Fresh(message)
            }
            Some(stored)
                if stored.sender_id == *user
                    && stored.conversation_id == message.conversation_id =>
            {
                Claim::Resent(stored.clone())
            }
            Some(_) => Claim::Taken,
        }
    };

    let message = match claim {
        Claim::Fresh(message) => message,
        Claim::Resent(message) => {
            tracing::debug!(user_id = %user, message_id = %message.id, "duplicate send, re-delivering");
            message
        }
        Claim::Taken => {
            tracing::warn!(user_id = %user, message_id = %id, "message id already taken");
            reply_error(state, user, format!("message id {id} is already in use")).await;
            return;
        }
    };
    let conversation = message.conversation_id.clone();
    state
        .broadcast_room(&conversation, &ServerEvent::NewMessage(message), None)
        .await;
}

/// Applies an edit from the message's sender and delivers the new version.
async fn handle_edit(user: &UserId, edit: EditMessage, state: &Arc<BackendState>) {
    if let Err(e) = validate_content(&edit.new_content) {
        reply_error(state, user, e.to_string()).await;
        return;
    }

    let edited = {
        let mut messages = state.messages.write().await;
        match messages.get_mut(&edit.message_id) {
            None => Err(format!("message {} not found", edit.message_id)),
            Some(message) if message.sender_id != *user => {
                Err("only the sender can edit a message".to_string())
            }
            Some(message) => {
                message.content = edit.new_content;
                message.is_edited = true;
                Ok(message.clone())
            }
        }
    };

    match edited {
        Ok(message) => {
            let conversation = message.conversation_id.clone();
            state
                .broadcast_room(&conversation, &ServerEvent::MessageEdited(message), None)
                .await;
        }
        Err(reason) => {
            tracing::warn!(user_id = %user, message_id = %edit.message_id, reason = %reason, "edit rejected");
            reply_error(state, user, reason).await;
        }
    }
}

async fn reply_error(state: &BackendState, user: &UserId, message: String) {
    state
        .send_to(user, &ServerEvent::Error(ErrorPayload { message }))
        .await;
}

fn encode_frame(event: &ServerEvent) -> Option<Frame> {
    match codec::encode(event) {
        Ok(text) => Some(Frame::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server event");
            None
        }
    }
}

/// Starts the backend on the given address and returns the bound address
/// and a join handle.
///
/// This is the primary entry point used by both `main.rs` and test code.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(BackendState::new())).await
}

/// Starts the backend with a pre-configured [`BackendState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<BackendState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/ws", axum::routing::get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "backend server error");
        }
    });

    Ok((bound_addr, handle))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<BackendState>>,
) -> impl axum::response::IntoResponse {
    ws.max_message_size(state.settings.max_frame_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}
