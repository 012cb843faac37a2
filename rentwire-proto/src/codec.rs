//! Text-frame codec for the `RentWire` wire protocol.
//!
//! Frames are single JSON documents of the form
//! `{"event": "<name>", "data": <payload>}`, carried one per WebSocket text
//! message. The same functions serve the client ([`ClientOp`] out,
//! [`ServerEvent`] in) and the backend (the reverse).
//!
//! [`ClientOp`]: crate::op::ClientOp
//! [`ServerEvent`]: crate::event::ServerEvent

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Maximum accepted frame size in bytes (128 KB).
///
/// Leaves headroom above [`MAX_MESSAGE_SIZE`](crate::message::MAX_MESSAGE_SIZE)
/// for the envelope and message metadata.
pub const MAX_FRAME_SIZE: usize = 128 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Encodes a frame into its JSON text form.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the value cannot be serialized,
/// or [`CodecError::FrameTooLarge`] if the result exceeds [`MAX_FRAME_SIZE`].
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    let text = serde_json::to_string(frame)?;
    check_size(text.len())?;
    Ok(text)
}

/// Decodes a frame from its JSON text form.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] before parsing oversized input, and
/// [`CodecError::Serialization`] for malformed JSON or unknown events.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

const fn check_size(size: usize) -> Result<(), CodecError> {
    if size > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
