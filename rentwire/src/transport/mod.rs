//! Transport layer abstraction for `RentWire`.
//!
//! A [`Connector`] opens and authenticates one [`Link`] to the messaging
//! backend; the `ConnectionManager` owns at most one live link at a time and
//! asks the connector for a new one when reconnecting.
//!
//! Concrete implementations:
//! - [`ws::WsConnector`] — WebSocket transport (JSON text frames)
//! - [`loopback::LoopbackConnector`] — in-process scripted backend for tests

pub mod loopback;
pub mod ws;

use std::fmt;

use rentwire_proto::codec::CodecError;
use rentwire_proto::event::ServerEvent;
use rentwire_proto::message::UserId;
use rentwire_proto::op::ClientOp;

/// Bearer credential presented during the handshake.
///
/// The token value is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

/// Reasons a credential is refused before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// No token was supplied.
    #[error("credential is empty")]
    Empty,
    /// The token contains whitespace or control characters.
    #[error("credential is malformed")]
    Malformed,
}

impl Credential {
    /// Wraps a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Checks the token is structurally usable.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] for empty or malformed tokens.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if self.0.is_empty() {
            return Err(CredentialError::Empty);
        }
        if self
            .0
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(CredentialError::Malformed);
        }
        Ok(())
    }

    /// Returns the raw token for the handshake frame.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No link is currently established.
    #[error("not connected")]
    NotConnected,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The backend could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend refused the credential during the handshake.
    #[error("credential rejected by backend: {0}")]
    AuthRejected(String),

    /// The backend violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the failure should stop automatic reconnection.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }

    /// Whether resending the same operation can never succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Codec(_))
    }
}

/// Opens authenticated links to the messaging backend.
pub trait Connector: Send + Sync + 'static {
    /// The link type this connector produces.
    type Link: Link;

    /// Open a link and complete the authentication handshake.
    ///
    /// Returns only once the backend has accepted (or rejected) the
    /// credential.
    fn connect(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<Self::Link, TransportError>> + Send;
}

/// One authenticated, bidirectional session with the backend.
pub trait Link: Send + Sync + 'static {
    /// The identity the backend authenticated.
    fn user_id(&self) -> &UserId;

    /// Dispatch one operation.
    ///
    /// `Ok(())` means the frame was handed to the transport, not that the
    /// backend processed it.
    fn send(
        &self,
        op: &ClientOp,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next inbound event.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the link is gone.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerEvent, TransportError>> + Send;

    /// Close the link. Idempotent.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}
