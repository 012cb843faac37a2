//! Connection lifecycle: connect, authenticate, disconnect and reconnect
//! with bounded linear backoff.
//!
//! A [`ConnectionManager`] owns at most one live [`Link`]. Once connected, a
//! supervisor task reads inbound events and republishes them on the
//! [`EventBus`]. When the link drops unexpectedly the same task runs the
//! reconnect loop:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --drop--> Reconnecting
//! Reconnecting --retry ok--> Connected
//! Reconnecting --retry failed, attempts < max--> Reconnecting
//! Reconnecting --attempts == max--> Errored
//! Connecting --failed--> Errored --scheduled retry--> Reconnecting
//! any --disconnect()--> Disconnected
//! ```
//!
//! Every connect attempt and supervisor belongs to a *generation*.
//! [`disconnect`](ConnectionManager::disconnect) and a fresh
//! [`connect`](ConnectionManager::connect) bump the generation; work from an
//! older generation notices and stops without touching state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use rentwire_proto::message::UserId;
use rentwire_proto::op::ClientOp;

use crate::bus::EventBus;
use crate::error::SyncError;
use crate::event::{ConnectionEvent, ConnectionState, DisconnectReason, SyncEvent};
use crate::queue::Dispatch;
use crate::transport::{Connector, Credential, Link, TransportError};

/// Timing knobs for connecting and reconnecting.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a connect attempt may take, handshake included.
    pub handshake_timeout: Duration,
    /// Reconnect delay unit; attempt `n` waits `n * base_delay`.
    pub base_delay: Duration,
    /// Consecutive failed reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            base_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

impl ConnectionConfig {
    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub const fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Hook run when a session is established, before the state becomes
/// [`ConnectionState::Connected`].
///
/// Implementations run with the manager's control lock held and must not
/// call back into the manager.
pub trait SessionListener: Send + Sync {
    /// A session for `user_id` is about to go live.
    fn on_connected(&self, user_id: &UserId);
}

enum AttemptError {
    Cancelled,
    Failed(TransportError),
}

#[derive(Default)]
struct Control {
    supervisor: Option<JoinHandle<()>>,
    credential: Option<Credential>,
}

struct Shared<C: Connector> {
    connector: C,
    bus: EventBus,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    generation: watch::Sender<u64>,
    link: Mutex<Option<Arc<C::Link>>>,
    user_id: Mutex<Option<UserId>>,
    control: Mutex<Control>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

/// Owns the single logical connection to the messaging backend.
///
/// Cloning yields another handle to the same connection.
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a disconnected manager announcing transitions on `bus`.
    pub fn new(connector: C, bus: EventBus, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                connector,
                bus,
                config,
                state,
                generation,
                link: Mutex::new(None),
                user_id: Mutex::new(None),
                control: Mutex::new(Control::default()),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers a hook run on every new session.
    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watches state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Identity the backend authenticated on the most recent session.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.shared.user_id.lock().clone()
    }

    /// Connects and authenticates, returning once the attempt settles.
    ///
    /// A no-op when already connected.
    ///
    /// # Errors
    ///
    /// - [`SyncError::AuthRejected`] for an unusable credential (no I/O is
    ///   attempted) or when the backend rejects it. No retry follows.
    /// - [`SyncError::ConnectInProgress`] while connecting or reconnecting.
    /// - [`SyncError::Cancelled`] if `disconnect` ran during the attempt.
    /// - [`SyncError::Transport`] if the attempt failed; a reconnect is
    ///   scheduled.
    pub async fn connect(&self, credential: Credential) -> Result<(), SyncError> {
        credential.validate()?;

        let generation = {
            let mut control = self.shared.control.lock();
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(SyncError::ConnectInProgress);
                }
                ConnectionState::Disconnected | ConnectionState::Errored => {}
            }
            if let Some(supervisor) = control.supervisor.take() {
                supervisor.abort();
            }
            control.credential = Some(credential);
            let generation = self.shared.bump_generation();
            self.shared.state.send_replace(ConnectionState::Connecting);
            generation
        };
        self.shared.announce(ConnectionState::Connecting, None);

        match self.shared.attempt(generation).await {
            Ok(link) => {
                let link = Arc::new(link);
                if !self.shared.install(generation, &link) {
                    link.close().await;
                    return Err(SyncError::Cancelled);
                }
                let supervisor = tokio::spawn(supervise(
                    Arc::clone(&self.shared),
                    generation,
                    Some(link),
                ));
                self.shared.adopt_supervisor(generation, supervisor);
                Ok(())
            }
            Err(AttemptError::Cancelled) => Err(SyncError::Cancelled),
            Err(AttemptError::Failed(err)) => {
                let fatal = err.is_fatal();
                if self.shared.fail(generation, &err) && !fatal {
                    let supervisor =
                        tokio::spawn(supervise(Arc::clone(&self.shared), generation, None));
                    self.shared.adopt_supervisor(generation, supervisor);
                }
                match err {
                    TransportError::AuthRejected(reason) => Err(SyncError::AuthRejected(reason)),
                    other => Err(SyncError::Transport(other)),
                }
            }
        }
    }

    /// Closes the connection and cancels any pending reconnect or in-flight
    /// attempt. Idempotent.
    pub async fn disconnect(&self) {
        let (link, previous) = {
            let mut control = self.shared.control.lock();
            self.shared.bump_generation();
            if let Some(supervisor) = control.supervisor.take() {
                supervisor.abort();
            }
            let link = self.shared.link.lock().take();
            let previous = self.shared.state.send_replace(ConnectionState::Disconnected);
            (link, previous)
        };

        if let Some(link) = link {
            link.close().await;
        }

        if previous != ConnectionState::Disconnected {
            tracing::info!(from = %previous, "disconnected by request");
            self.shared
                .bus
                .publish(SyncEvent::Connection(ConnectionEvent::Disconnected {
                    reason: DisconnectReason::Manual,
                }));
            self.shared
                .announce(ConnectionState::Disconnected, Some(DisconnectReason::Manual));
        }
    }
}

impl<C: Connector> Dispatch for ConnectionManager<C> {
    async fn dispatch(&self, op: &ClientOp) -> Result<(), TransportError> {
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        let link = self
            .shared
            .link
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        link.send(op).await
    }
}

impl<C: Connector> Shared<C> {
    fn bump_generation(&self) -> u64 {
        self.generation.send_modify(|g| *g += 1);
        *self.generation.borrow()
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation.borrow() == generation
    }

    fn announce(&self, state: ConnectionState, reason: Option<DisconnectReason>) {
        self.bus
            .publish(SyncEvent::Connection(ConnectionEvent::Status { state, reason }));
    }

    /// Sets `state` if `generation` is still current. Returns the previous
    /// state, or `None` if the generation is stale.
    fn transition(&self, generation: u64, state: ConnectionState) -> Option<ConnectionState> {
        let _control = self.control.lock();
        self.is_current(generation)
            .then(|| self.state.send_replace(state))
    }

    /// One connect attempt bounded by the handshake timeout. Resolves to
    /// `Cancelled` as soon as the generation moves on.
    async fn attempt(&self, generation: u64) -> Result<C::Link, AttemptError> {
        let credential = {
            let control = self.control.lock();
            if !self.is_current(generation) {
                return Err(AttemptError::Cancelled);
            }
            control.credential.clone()
        };
        let Some(credential) = credential else {
            return Err(AttemptError::Cancelled);
        };

        let cancelled = generation_changed(self.generation.subscribe(), generation);
        let attempt = tokio::time::timeout(
            self.config.handshake_timeout,
            self.connector.connect(&credential),
        );

        tokio::select! {
            () = cancelled => Err(AttemptError::Cancelled),
            result = attempt => match result {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(err)) => Err(AttemptError::Failed(err)),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.config.handshake_timeout.as_millis(),
                        "connect attempt timed out"
                    );
                    Err(AttemptError::Failed(TransportError::Timeout))
                }
            },
        }
    }

    /// Makes `link` the live session and announces it. Returns `false` if
    /// the generation moved on, in which case the caller closes the link.
    fn install(&self, generation: u64, link: &Arc<C::Link>) -> bool {
        let user_id = link.user_id().clone();
        let previous = {
            let _control = self.control.lock();
            if !self.is_current(generation) {
                return false;
            }
            *self.link.lock() = Some(Arc::clone(link));
            *self.user_id.lock() = Some(user_id.clone());
            for listener in self.listeners.read().iter() {
                listener.on_connected(&user_id);
            }
            self.state.send_replace(ConnectionState::Connected)
        };

        tracing::info!(user_id = %user_id, from = %previous, "connected");
        self.announce(ConnectionState::Connected, None);
        self.bus
            .publish(SyncEvent::Connection(ConnectionEvent::Connected { user_id }));
        true
    }

    /// Records a failed attempt: `Errored` plus `ConnectionError`. Returns
    /// `false` if the generation is stale.
    fn fail(&self, generation: u64, err: &TransportError) -> bool {
        let Some(previous) = self.transition(generation, ConnectionState::Errored) else {
            return false;
        };
        tracing::warn!(err = %err, from = %previous, "connect attempt failed");
        if previous != ConnectionState::Errored {
            self.announce(ConnectionState::Errored, None);
        }
        self.bus
            .publish(SyncEvent::Connection(ConnectionEvent::ConnectionError {
                error: err.to_string(),
            }));
        true
    }

    fn adopt_supervisor(&self, generation: u64, supervisor: JoinHandle<()>) {
        let mut control = self.control.lock();
        if self.is_current(generation) {
            control.supervisor = Some(supervisor);
        } else {
            supervisor.abort();
        }
    }

    /// Forwards inbound events until the link fails. Returns why it ended.
    async fn pump(&self, link: &C::Link) -> String {
        loop {
            match link.recv().await {
                Ok(event) => {
                    if let Some(event) = SyncEvent::from_server(event) {
                        self.bus.publish(event);
                    }
                }
                Err(err) => return err.to_string(),
            }
        }
    }

    /// Handles an unexpected drop. Returns `false` if the generation is stale.
    fn dropped(&self, generation: u64, detail: String) -> bool {
        let previous = {
            let _control = self.control.lock();
            if !self.is_current(generation) {
                return false;
            }
            self.link.lock().take();
            self.state.send_replace(ConnectionState::Reconnecting)
        };
        tracing::warn!(reason = %detail, from = %previous, "connection dropped");
        let reason = DisconnectReason::Transport(detail);
        self.bus
            .publish(SyncEvent::Connection(ConnectionEvent::Disconnected {
                reason: reason.clone(),
            }));
        self.announce(ConnectionState::Reconnecting, Some(reason));
        true
    }

    /// Retries with linear backoff. Returns the new link, or `None` once
    /// the retries are exhausted, rejected, or cancelled.
    async fn reconnect(&self, generation: u64) -> Option<Arc<C::Link>> {
        let max_attempts = self.config.max_attempts;
        for attempt in 1..=max_attempts {
            let delay = self.config.delay_for(attempt);
            let previous = self.transition(generation, ConnectionState::Reconnecting)?;
            if previous != ConnectionState::Reconnecting {
                self.announce(ConnectionState::Reconnecting, None);
            }
            tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnect scheduled");
            self.bus
                .publish(SyncEvent::Connection(ConnectionEvent::Reconnecting {
                    attempt,
                    delay,
                }));

            tokio::time::sleep(delay).await;

            match self.attempt(generation).await {
                Ok(link) => {
                    let link = Arc::new(link);
                    if self.install(generation, &link) {
                        return Some(link);
                    }
                    link.close().await;
                    return None;
                }
                Err(AttemptError::Cancelled) => return None,
                Err(AttemptError::Failed(err)) if err.is_fatal() => {
                    self.fail(generation, &err);
                    return None;
                }
                Err(AttemptError::Failed(err)) => {
                    tracing::warn!(attempt, err = %err, "reconnect attempt failed");
                    self.bus
                        .publish(SyncEvent::Connection(ConnectionEvent::ConnectionError {
                            error: err.to_string(),
                        }));
                }
            }
        }

        if self
            .transition(generation, ConnectionState::Errored)
            .is_some()
        {
            tracing::error!(attempts = max_attempts, "reconnection failed, giving up");
            self.announce(ConnectionState::Errored, None);
            self.bus
                .publish(SyncEvent::Connection(ConnectionEvent::ReconnectionFailed {
                    attempts: max_attempts,
                }));
        }
        None
    }
}

/// Resolves once the generation differs from `generation`.
async fn generation_changed(mut rx: watch::Receiver<u64>, generation: u64) {
    loop {
        if *rx.borrow_and_update() != generation {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Per-generation background task: pumps the live link, then reconnects
/// after a drop, for as long as the generation stays current.
async fn supervise<C: Connector>(
    shared: Arc<Shared<C>>,
    generation: u64,
    mut link: Option<Arc<C::Link>>,
) {
    loop {
        if let Some(live) = link.take() {
            let detail = shared.pump(&live).await;
            live.close().await;
            if !shared.dropped(generation, detail) {
                return;
            }
        }
        match shared.reconnect(generation).await {
            Some(next) => link = Some(next),
            None => return,
        }
    }
}
