//! Typed event vocabulary carried on the [`EventBus`](crate::bus::EventBus).
//!
//! Events are grouped by category so every handler can match exhaustively on
//! the category it cares about:
//!
//! | Category | Produced by |
//! |---|---|
//! | [`ConnectionEvent`] | `ConnectionManager` state transitions |
//! | [`MessageEvent`] | inbound message traffic and `MessageReconciler` list changes |
//! | [`TypingEvent`] | inbound typing notices |
//! | [`PresenceEvent`] | inbound presence changes |
//! | [`RoomEvent`] | local join/leave and inbound membership notices |

use std::fmt;
use std::time::Duration;

use rentwire_proto::event::{Membership, ReadReceipt, ServerEvent, StatusChange, TypingNotice};
use rentwire_proto::message::{ConversationId, Message, MessageId, UserId};

/// Lifecycle state of the client's single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// An explicit `connect` is performing the handshake.
    Connecting,
    /// Authenticated and exchanging events.
    Connected,
    /// The link dropped unexpectedly; automatic retries are scheduled.
    Reconnecting,
    /// The last attempt failed; waiting for a scheduled retry or an
    /// explicit `connect`.
    Errored,
}

impl ConnectionState {
    /// Whether operations may be dispatched in this state.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application called `disconnect`.
    Manual,
    /// The transport failed or the backend closed the socket.
    Transport(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Transport(detail) => write!(f, "transport: {detail}"),
        }
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Published on every state transition.
    Status {
        /// The state just entered.
        state: ConnectionState,
        /// Why the connection ended, when the transition is a disconnect.
        reason: Option<DisconnectReason>,
    },
    /// The handshake completed.
    Connected {
        /// Identity the backend authenticated.
        user_id: UserId,
    },
    /// The connection ended.
    Disconnected {
        /// Manual or transport-initiated.
        reason: DisconnectReason,
    },
    /// A connection attempt failed.
    ConnectionError {
        /// Description of the failure.
        error: String,
    },
    /// A reconnect attempt has been scheduled.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Delay before the attempt runs.
        delay: Duration,
    },
    /// Automatic reconnection gave up.
    ReconnectionFailed {
        /// Number of consecutive failed attempts.
        attempts: u32,
    },
    /// The backend reported a non-fatal error.
    ServerError {
        /// Backend-provided description.
        message: String,
    },
    /// A queued operation could never be sent and was dropped.
    DispatchFailed {
        /// The dropped operation.
        operation: String,
        /// Why it could not be sent.
        error: String,
    },
}

/// What changed in a conversation's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListChange {
    /// A message was inserted.
    Inserted(MessageId),
    /// A message was replaced in place.
    Updated(MessageId),
    /// Messages were marked read.
    Read {
        /// How many messages flipped to read.
        count: usize,
    },
    /// A history page was merged.
    PageMerged {
        /// How many new messages the page contributed.
        inserted: usize,
    },
    /// A message was removed after a delete acknowledgment.
    Removed(MessageId),
}

/// Message traffic and message-list notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    /// Inbound `new_message`.
    Received(Message),
    /// Inbound `message_edited`.
    Edited(Message),
    /// Inbound `messages_read`.
    Read(ReadReceipt),
    /// A conversation's reconciled list changed.
    ListChanged {
        /// Which conversation.
        conversation_id: ConversationId,
        /// What happened.
        change: ListChange,
    },
}

/// Inbound typing notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingEvent {
    /// Inbound `user_typing`.
    Started(TypingNotice),
    /// Inbound `user_stopped_typing`.
    Stopped(TypingNotice),
    /// An entry aged out without a stop notice.
    Expired(TypingNotice),
}

/// Inbound presence notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Inbound `user_status_changed`.
    StatusChanged(StatusChange),
}

/// Room membership notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The local client joined a conversation room.
    Joined(ConversationId),
    /// The local client left a conversation room.
    Left(ConversationId),
    /// Inbound `user_joined`.
    MemberJoined(Membership),
    /// Inbound `user_left`.
    MemberLeft(Membership),
}

/// Every event the bus carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Connection lifecycle.
    Connection(ConnectionEvent),
    /// Messages.
    Message(MessageEvent),
    /// Typing indicators.
    Typing(TypingEvent),
    /// Presence.
    Presence(PresenceEvent),
    /// Room membership.
    Room(RoomEvent),
}

impl SyncEvent {
    /// Maps an inbound backend event onto the bus vocabulary.
    ///
    /// Handshake frames are consumed by the transport and have no bus
    /// counterpart, so they map to `None`.
    #[must_use]
    pub fn from_server(event: ServerEvent) -> Option<Self> {
        let mapped = match event {
            ServerEvent::Authenticated(_) | ServerEvent::ConnectError(_) => return None,
            ServerEvent::NewMessage(msg) => Self::Message(MessageEvent::Received(msg)),
            ServerEvent::MessageEdited(msg) => Self::Message(MessageEvent::Edited(msg)),
            ServerEvent::MessagesRead(receipt) => Self::Message(MessageEvent::Read(receipt)),
            ServerEvent::UserTyping(notice) => Self::Typing(TypingEvent::Started(notice)),
            ServerEvent::UserStoppedTyping(notice) => Self::Typing(TypingEvent::Stopped(notice)),
            ServerEvent::UserStatusChanged(change) => {
                Self::Presence(PresenceEvent::StatusChanged(change))
            }
            ServerEvent::UserJoined(m) => Self::Room(RoomEvent::MemberJoined(m)),
            ServerEvent::UserLeft(m) => Self::Room(RoomEvent::MemberLeft(m)),
            ServerEvent::Error(payload) => Self::Connection(ConnectionEvent::ServerError {
                message: payload.message,
            }),
        };
        Some(mapped)
    }
}
