//! Inbound events the messaging backend pushes to connected clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, Message, UserId};

/// Handshake acknowledgment carrying the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// The user the presented credential belongs to.
    pub user_id: UserId,
}

/// Error payload shared by `connect_error` and `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub message: String,
}

/// Payload of `messages_read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    /// Conversation whose messages were read.
    pub conversation_id: ConversationId,
    /// The user who read them.
    pub read_by: UserId,
}

/// Payload of `user_typing` and `user_stopped_typing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    /// The user typing.
    pub user_id: UserId,
    /// Where they are typing.
    pub conversation_id: ConversationId,
}

/// Payload of `user_status_changed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    /// The user whose status changed.
    pub user_id: UserId,
    /// Whether the user currently has a live connection.
    pub is_online: bool,
    /// When the user was last seen, if known.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Payload of `user_joined` and `user_left`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    /// The conversation room.
    pub conversation_id: ConversationId,
    /// The user who joined or left it.
    pub user_id: UserId,
}

/// An event pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake accepted.
    Authenticated(SessionInfo),
    /// Handshake rejected; the backend closes the socket afterwards.
    ConnectError(ErrorPayload),
    /// A message was posted to a joined conversation.
    NewMessage(Message),
    /// A message in a joined conversation was edited.
    MessageEdited(Message),
    /// A participant read the conversation.
    MessagesRead(ReadReceipt),
    /// A participant started typing.
    UserTyping(TypingNotice),
    /// A participant stopped typing.
    UserStoppedTyping(TypingNotice),
    /// A user came online or went offline.
    UserStatusChanged(StatusChange),
    /// A participant joined a conversation room.
    UserJoined(Membership),
    /// A participant left a conversation room.
    UserLeft(Membership),
    /// A non-fatal backend error, e.g. a rejected edit.
    Error(ErrorPayload),
}
