//! Typing indicators in both directions.
//!
//! **Outbound.** [`TypingCoordinator::start_typing`] sends `typing_start`
//! once per burst and arms an auto-stop timer; each further call inside the
//! burst only resets the timer. The burst ends with `typing_stop`, either
//! explicitly or when the timer expires.
//!
//! **Inbound.** Each `(conversation, user)` pair has at most one entry with
//! an expiry deadline. A start notice creates or refreshes it, a stop
//! notice removes it. Expired entries are dropped on read and by the
//! background sweeper ([`spawn_sweeper`]).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use rentwire_proto::event::TypingNotice;
use rentwire_proto::message::{ConversationId, UserId};
use rentwire_proto::op::ClientOp;

use crate::bus::{EventBus, EventHandler};
use crate::event::{ConnectionEvent, RoomEvent, SyncEvent, TypingEvent};
use crate::queue::OutboundQueue;
use crate::timer::Timers;

/// Typing timings.
#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Idle time after which an outbound burst stops on its own.
    pub auto_stop: Duration,
    /// Lifetime of an inbound entry without a refresh.
    pub ttl: Duration,
    /// How often the sweeper drops expired entries.
    pub sweep_interval: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            auto_stop: Duration::from_secs(3),
            ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

type TypingKey = (ConversationId, UserId);

/// Outbound debounce plus the inbound typing table.
pub struct TypingCoordinator {
    config: TypingConfig,
    queue: Arc<OutboundQueue>,
    outbound: Timers<ConversationId>,
    inbound: Mutex<HashMap<TypingKey, Instant>>,
    local_user: RwLock<Option<UserId>>,
}

impl TypingCoordinator {
    /// Creates a coordinator dispatching through `queue`.
    pub fn new(config: TypingConfig, queue: Arc<OutboundQueue>) -> Self {
        Self {
            config,
            queue,
            outbound: Timers::new(),
            inbound: Mutex::new(HashMap::new()),
            local_user: RwLock::new(None),
        }
    }

    /// Sets the user excluded from [`typing_users`](Self::typing_users).
    pub fn set_local_user(&self, user_id: UserId) {
        *self.local_user.write() = Some(user_id);
    }

    /// The local user typed in `id`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_typing(&self, id: &ConversationId) {
        let queue = Arc::clone(&self.queue);
        let conversation = id.clone();
        let was_active = self
            .outbound
            .schedule(id.clone(), self.config.auto_stop, move || {
                tracing::debug!(conversation = %conversation, "typing auto-stop");
                queue.enqueue_or_send(ClientOp::TypingStop(conversation));
            });
        if !was_active {
            self.queue.enqueue_or_send(ClientOp::TypingStart(id.clone()));
        }
    }

    /// The local user stopped typing in `id`. No-op unless a burst is active.
    pub fn stop_typing(&self, id: &ConversationId) {
        if self.outbound.cancel(id) {
            self.queue.enqueue_or_send(ClientOp::TypingStop(id.clone()));
        }
    }

    /// Whether an outbound burst is active in `id`.
    #[must_use]
    pub fn is_typing(&self, id: &ConversationId) -> bool {
        self.outbound.is_armed(id)
    }

    /// Users currently typing in `id`, excluding the local user, sorted.
    #[must_use]
    pub fn typing_users(&self, id: &ConversationId) -> Vec<UserId> {
        let local = self.local_user.read().clone();
        let now = Instant::now();
        // Expired entries are left for the sweep so it can announce them.
        let mut users: Vec<UserId> = self
            .inbound
            .lock()
            .iter()
            .filter(|((conversation, user), expires_at)| {
                **expires_at > now && conversation == id && Some(user) != local.as_ref()
            })
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Drops expired inbound entries and returns them.
    pub fn sweep(&self) -> Vec<TypingNotice> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.inbound.lock().retain(|(conversation, user), expires_at| {
            if *expires_at > now {
                return true;
            }
            expired.push(TypingNotice {
                user_id: user.clone(),
                conversation_id: conversation.clone(),
            });
            false
        });
        expired
    }

    /// Cancels every timer and forgets every entry.
    pub fn clear(&self) {
        self.outbound.cancel_all();
        self.inbound.lock().clear();
    }

    fn clear_conversation(&self, id: &ConversationId) {
        self.outbound.cancel(id);
        self.inbound
            .lock()
            .retain(|(conversation, _), _| conversation != id);
    }
}

impl EventHandler for TypingCoordinator {
    fn handle(&self, event: &SyncEvent, _bus: &EventBus) {
        match event {
            SyncEvent::Typing(TypingEvent::Started(notice)) => {
                let expires_at = Instant::now() + self.config.ttl;
                self.inbound.lock().insert(
                    (notice.conversation_id.clone(), notice.user_id.clone()),
                    expires_at,
                );
            }
            SyncEvent::Typing(TypingEvent::Stopped(notice)) => {
                self.inbound
                    .lock()
                    .remove(&(notice.conversation_id.clone(), notice.user_id.clone()));
            }
            SyncEvent::Room(RoomEvent::Left(id)) => self.clear_conversation(id),
            SyncEvent::Connection(ConnectionEvent::Connected { user_id }) => {
                self.set_local_user(user_id.clone());
            }
            _ => {}
        }
    }
}

/// Spawns the periodic sweep, publishing [`TypingEvent::Expired`] for every
/// entry that aged out.
pub fn spawn_sweeper(coordinator: Arc<TypingCoordinator>, bus: EventBus) -> JoinHandle<()> {
    let period = coordinator.config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for notice in coordinator.sweep() {
                tracing::trace!(
                    conversation = %notice.conversation_id,
                    user_id = %notice.user_id,
                    "typing entry expired"
                );
                bus.publish(SyncEvent::Typing(TypingEvent::Expired(notice)));
            }
        }
    })
}
