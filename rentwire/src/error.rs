//! Error types surfaced by the engine's public API.

use rentwire_proto::codec::CodecError;
use rentwire_proto::message::ValidationError;

use crate::transport::{CredentialError, TransportError};

/// Errors returned by [`SyncClient`](crate::client::SyncClient) and
/// [`ConnectionManager`](crate::connection::ConnectionManager).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The credential was refused, locally or by the backend. Never retried.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The connection attempt failed at the transport level.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A connection attempt is already running.
    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    /// `disconnect` was called while this attempt was in flight.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// The message content was refused before it was queued.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The operation would not encode into a single frame.
    #[error("operation does not fit in one frame: {0}")]
    Codec(#[from] CodecError),
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        Self::AuthRejected(err.to_string())
    }
}
