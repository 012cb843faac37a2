//! Loopback transport for testing.
//!
//! [`LoopbackBackend`] is an in-process stand-in for the messaging backend.
//! Tests script how each connect attempt ends, inject inbound events with
//! [`emit`](LoopbackBackend::emit), drop the live session with
//! [`sever`](LoopbackBackend::sever), and inspect every operation the client
//! dispatched.
//!
//! The authenticated user id of a loopback link is the credential token.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use rentwire_proto::event::ServerEvent;
use rentwire_proto::message::UserId;
use rentwire_proto::op::ClientOp;

use super::{Connector, Credential, Link, TransportError};

/// How a scripted connect attempt ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Handshake succeeds.
    Accept,
    /// The backend is unreachable.
    Refuse,
    /// The backend rejects the credential with the given reason.
    Reject(String),
    /// The handshake never completes.
    Hang,
}

#[derive(Default)]
struct LoopState {
    /// Outcomes for upcoming attempts; `Accept` once exhausted.
    script: VecDeque<ConnectOutcome>,
    /// Token presented on every attempt, in order.
    attempts: Vec<String>,
    /// Every operation a live link accepted.
    dispatched: Vec<ClientOp>,
    /// Number of upcoming sends to fail.
    fail_sends: usize,
    /// Bumped whenever the live session ends.
    epoch: u64,
    /// Feeds the live link's inbound channel.
    inbound: Option<mpsc::UnboundedSender<ServerEvent>>,
}

/// Scripted in-process backend. Cloning yields another handle to the same
/// backend.
#[derive(Clone, Default)]
pub struct LoopbackBackend {
    state: Arc<Mutex<LoopState>>,
}

impl LoopbackBackend {
    /// Creates a backend that accepts every connect attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a connector opening links to this backend.
    #[must_use]
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            backend: self.clone(),
        }
    }

    /// Queues outcomes for the next connect attempts.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Delivers an event to the live link. Returns `false` if no link is live.
    pub fn emit(&self, event: ServerEvent) -> bool {
        let state = self.state.lock();
        state
            .inbound
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Ends the live session as if the network dropped.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        if state.inbound.take().is_some() {
            state.epoch += 1;
            tracing::debug!(epoch = state.epoch, "loopback session severed");
        }
    }

    /// Whether a link is currently live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state.lock().inbound.is_some()
    }

    /// Operations dispatched so far, in arrival order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<ClientOp> {
        self.state.lock().dispatched.clone()
    }

    /// Forgets recorded operations.
    pub fn clear_dispatched(&self) {
        self.state.lock().dispatched.clear();
    }

    /// Number of connect attempts seen so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Makes the next `n` sends fail with a transport error.
    pub fn fail_next_sends(&self, n: usize) {
        self.state.lock().fail_sends = n;
    }

    /// Runs one attempt. `Err(None)` means the handshake hangs.
    fn open(&self, credential: &Credential) -> Result<LoopbackLink, Option<TransportError>> {
        let mut state = self.state.lock();
        state.attempts.push(credential.expose().to_string());
        match state.script.pop_front().unwrap_or(ConnectOutcome::Accept) {
            ConnectOutcome::Accept => {}
            ConnectOutcome::Refuse => {
                return Err(Some(TransportError::Unreachable(
                    "loopback backend refused".into(),
                )));
            }
            ConnectOutcome::Reject(reason) => {
                return Err(Some(TransportError::AuthRejected(reason)));
            }
            ConnectOutcome::Hang => return Err(None),
        }
        // A new session replaces any previous one.
        state.epoch += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        Ok(LoopbackLink {
            user_id: UserId::new(credential.expose()),
            epoch: state.epoch,
            backend: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }
}

/// Opens links to a [`LoopbackBackend`].
#[derive(Clone)]
pub struct LoopbackConnector {
    backend: LoopbackBackend,
}

impl Connector for LoopbackConnector {
    type Link = LoopbackLink;

    async fn connect(&self, credential: &Credential) -> Result<LoopbackLink, TransportError> {
        match self.backend.open(credential) {
            Ok(link) => Ok(link),
            Err(Some(err)) => Err(err),
            Err(None) => std::future::pending().await,
        }
    }
}

/// One session with a [`LoopbackBackend`].
pub struct LoopbackLink {
    user_id: UserId,
    epoch: u64,
    backend: LoopbackBackend,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
}

impl Link for LoopbackLink {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn send(&self, op: &ClientOp) -> Result<(), TransportError> {
        let mut state = self.backend.state.lock();
        if state.epoch != self.epoch || state.inbound.is_none() {
            return Err(TransportError::ConnectionClosed);
        }
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(TransportError::Io(std::io::Error::other(
                "injected send failure",
            )));
        }
        state.dispatched.push(op.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        let mut state = self.backend.state.lock();
        if state.epoch == self.epoch && state.inbound.take().is_some() {
            state.epoch += 1;
        }
    }
}
