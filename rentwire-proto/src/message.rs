//! Wire format message types for the `RentWire` protocol.
//!
//! Identifiers are opaque strings assigned by the messaging backend. The
//! only identifiers minted on the client are message ids for optimistic
//! sends, which use UUID v7 so they sort by creation time.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an identifier string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifies a conversation (the room that scopes messages, typing and
    /// membership events).
    ConversationId
);

string_id!(
    /// Identifies a single message within the backend.
    MessageId
);

string_id!(
    /// Identifies a marketplace user.
    UserId
);

impl MessageId {
    /// Mints a time-ordered identifier (UUID v7) for an optimistic send.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// The kind of content a message carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Plain text.
    #[default]
    Text,
    /// An image reference (URL or upload key in `content`).
    Image,
    /// A file reference (URL or upload key in `content`).
    File,
    /// A backend-generated notice, e.g. "booking confirmed".
    System,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Image => write!(f, "image"),
            Self::File => write!(f, "file"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A chat message as delivered by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier of the message.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author of the message.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Content kind.
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    /// Creation time assigned by the backend (or the client, for
    /// optimistic sends).
    pub created_at: DateTime<Utc>,
    /// Whether the content was edited after creation.
    #[serde(default)]
    pub is_edited: bool,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub is_read: bool,
    /// The message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

impl Message {
    /// Builds an unsent text message stamped with the current time and a
    /// freshly minted id.
    #[must_use]
    pub fn draft(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            sender_id,
            content: content.into(),
            kind: MessageType::Text,
            created_at: Utc::now(),
            is_edited: false,
            is_read: false,
            reply_to_id: None,
        }
    }
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Validates message content before it is queued for sending.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for blank content and
/// [`ValidationError::TooLarge`] when it exceeds [`MAX_MESSAGE_SIZE`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if content.len() > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size: content.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
