//! Outbound operations a client dispatches to the messaging backend.
//!
//! Every operation is a named event with a JSON payload. On the wire a
//! [`ClientOp`] looks like `{"event": "join_conversation", "data": "c1"}`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, MessageId, MessageType};

/// Payload of a `send_message` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Message body.
    pub content: String,
    /// Content kind.
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    /// The message being replied to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Client-minted id used for the optimistic copy. A backend that
    /// honours it echoes the same id back in `new_message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

/// Payload of an `edit_message` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    /// Message to edit.
    pub message_id: MessageId,
    /// Replacement content.
    pub new_content: String,
}

/// An operation dispatched from the client to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientOp {
    /// Subscribe this connection to a conversation room.
    JoinConversation(ConversationId),
    /// Unsubscribe this connection from a conversation room.
    LeaveConversation(ConversationId),
    /// Post a new message.
    SendMessage(SendMessage),
    /// The local user started typing.
    TypingStart(ConversationId),
    /// The local user stopped typing.
    TypingStop(ConversationId),
    /// Mark every message addressed to the local user as read.
    MarkMessagesRead(ConversationId),
    /// Replace the content of a previously sent message.
    EditMessage(EditMessage),
}

/// Coarse classification of a [`ClientOp`], used for queue bookkeeping and
/// logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// `join_conversation`.
    JoinRoom,
    /// `leave_conversation`.
    LeaveRoom,
    /// `send_message`.
    SendMessage,
    /// `mark_messages_read`.
    MarkRead,
    /// `edit_message`.
    EditMessage,
    /// `typing_start`.
    StartTyping,
    /// `typing_stop`.
    StopTyping,
}

impl ClientOp {
    /// Returns the classification of this operation.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::JoinConversation(_) => OperationKind::JoinRoom,
            Self::LeaveConversation(_) => OperationKind::LeaveRoom,
            Self::SendMessage(_) => OperationKind::SendMessage,
            Self::TypingStart(_) => OperationKind::StartTyping,
            Self::TypingStop(_) => OperationKind::StopTyping,
            Self::MarkMessagesRead(_) => OperationKind::MarkRead,
            Self::EditMessage(_) => OperationKind::EditMessage,
        }
    }

    /// Returns the conversation this operation is scoped to.
    ///
    /// Edits are addressed by message id only and have no conversation scope.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::JoinConversation(id)
            | Self::LeaveConversation(id)
            | Self::TypingStart(id)
            | Self::TypingStop(id)
            | Self::MarkMessagesRead(id) => Some(id),
            Self::SendMessage(send) => Some(&send.conversation_id),
            Self::EditMessage(_) => None,
        }
    }

    /// Returns the wire event name.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::JoinConversation(_) => "join_conversation",
            Self::LeaveConversation(_) => "leave_conversation",
            Self::SendMessage(_) => "send_message",
            Self::TypingStart(_) => "typing_start",
            Self::TypingStop(_) => "typing_stop",
            Self::MarkMessagesRead(_) => "mark_messages_read",
            Self::EditMessage(_) => "edit_message",
        }
    }
}

impl fmt::Display for ClientOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conversation_id() {
            Some(id) => write!(f, "{}({id})", self.event_name()),
            None => write!(f, "{}", self.event_name()),
        }
    }
}

/// First frame a client sends after the socket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Handshake {
    /// Present a bearer credential to the backend.
    Authenticate {
        /// Opaque session token.
        token: String,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn join_serializes_as_named_event_with_string_payload() {
        let op = ClientOp::JoinConversation(ConversationId::new("c1"));
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value, json!({"event": "join_conversation", "data": "c1"}));
    }

    #[test]
    fn send_message_payload_shape() {
        let op = ClientOp::SendMessage(SendMessage {
            conversation_id: ConversationId::new("c1"),
            content: "Can I pick up the drill at 5?".into(),
            kind: MessageType::Text,
            reply_to_id: None,
            message_id: Some(MessageId::new("local-1")),
        });
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "send_message",
                "data": {
                    "conversationId": "c1",
                    "content": "Can I pick up the drill at 5?",
                    "type": "text",
                    "messageId": "local-1"
                }
            })
        );
    }

    #[test]
    fn edit_message_payload_shape() {
        let op = ClientOp::EditMessage(EditMessage {
            message_id: MessageId::new("m1"),
            new_content: "fixed typo".into(),
        });
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(
            value,
            json!({"event": "edit_message", "data": {"messageId": "m1", "newContent": "fixed typo"}})
        );
    }

    #[test]
    fn event_names_match_serialized_tags() {
        let c = ConversationId::new("c");
        let ops = [
            ClientOp::JoinConversation(c.clone()),
            ClientOp::LeaveConversation(c.clone()),
            ClientOp::TypingStart(c.clone()),
            ClientOp::TypingStop(c.clone()),
            ClientOp::MarkMessagesRead(c),
        ];
        for op in ops {
            let value = serde_json::to_value(&op).unwrap();
            assert_eq!(value["event"], op.event_name());
        }
    }

    #[test]
    fn edit_has_no_conversation_scope() {
        let op = ClientOp::EditMessage(EditMessage {
            message_id: MessageId::new("m1"),
            new_content: "x".into(),
        });
        assert!(op.conversation_id().is_none());
        assert_eq!(op.kind(), OperationKind::EditMessage);
        assert_eq!(op.to_string(), "edit_message");
    }

    #[test]
    fn display_includes_conversation() {
        let op = ClientOp::TypingStart(ConversationId::new("c9"));
        assert_eq!(op.to_string(), "typing_start(c9)");
        assert_eq!(op.kind(), OperationKind::StartTyping);
    }

    #[test]
    fn handshake_shape() {
        let hello = Handshake::Authenticate {
            token: "tok".into(),
        };
        let value = serde_json::to_value(&hello).unwrap();
        assert_eq!(value, json!({"event": "authenticate", "data": {"token": "tok"}}));
    }
}
