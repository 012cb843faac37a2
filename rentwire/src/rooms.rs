//! Room membership: the set of conversations the client intends to be in.
//!
//! The set survives disconnects. Every new session re-joins each room
//! before anything else in the outbound queue is flushed.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use rentwire_proto::message::{ConversationId, UserId};
use rentwire_proto::op::ClientOp;

use crate::bus::EventBus;
use crate::connection::SessionListener;
use crate::event::{RoomEvent, SyncEvent};
use crate::queue::OutboundQueue;

/// Tracks joined conversation rooms.
pub struct RoomMembership {
    rooms: Mutex<HashSet<ConversationId>>,
    queue: Arc<OutboundQueue>,
    bus: EventBus,
}

impl RoomMembership {
    /// Creates an empty membership set dispatching through `queue`.
    pub fn new(queue: Arc<OutboundQueue>, bus: EventBus) -> Self {
        Self {
            rooms: Mutex::new(HashSet::new()),
            queue,
            bus,
        }
    }

    /// Joins `id`. Joining a room already in the set re-sends the join.
    pub fn join(&self, id: ConversationId) {
        let newly = self.rooms.lock().insert(id.clone());
        tracing::info!(conversation = %id, newly, "joining room");
        self.queue
            .enqueue_or_send(ClientOp::JoinConversation(id.clone()));
        self.bus.publish(SyncEvent::Room(RoomEvent::Joined(id)));
    }

    /// Leaves `id`: drops it from the set, discards its queued operations,
    /// and sends the leave.
    ///
    /// The `Left` event published here is what clears the room's typing
    /// state.
    pub fn leave(&self, id: &ConversationId) {
        let was_joined = self.rooms.lock().remove(id);
        let purged = self.queue.purge(id);
        tracing::info!(conversation = %id, was_joined, purged, "leaving room");
        self.bus.publish(SyncEvent::Room(RoomEvent::Left(id.clone())));
        self.queue
            .enqueue_or_send(ClientOp::LeaveConversation(id.clone()));
    }

    /// Whether `id` is in the set.
    #[must_use]
    pub fn is_joined(&self, id: &ConversationId) -> bool {
        self.rooms.lock().contains(id)
    }

    /// Snapshot of the set, sorted.
    #[must_use]
    pub fn rooms(&self) -> Vec<ConversationId> {
        let mut rooms: Vec<_> = self.rooms.lock().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Forgets every room without sending leaves.
    pub fn clear(&self) {
        self.rooms.lock().clear();
    }
}

impl SessionListener for RoomMembership {
    fn on_connected(&self, user_id: &UserId) {
        let rooms = self.rooms.lock().clone();
        if rooms.is_empty() {
            return;
        }
        tracing::info!(user_id = %user_id, count = rooms.len(), "re-joining rooms");
        // Joins still queued from before the session are superseded.
        self.queue.retain(
            |op| !matches!(op, ClientOp::JoinConversation(id) if rooms.contains(id)),
        );
        let mut ordered: Vec<_> = rooms.into_iter().collect();
        ordered.sort();
        self.queue
            .push_front_batch(ordered.into_iter().map(ClientOp::JoinConversation).collect());
    }
}
