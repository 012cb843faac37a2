//! Per-conversation message lists: ordered by `created_at`, unique by id.
//!
//! Inbound messages, optimistic local sends and history pages all merge
//! through the same rules:
//!
//! - a message whose id is already in the conversation is a no-op;
//! - otherwise it is inserted after every message with an earlier or equal
//!   `created_at`, so ties keep arrival order.
//!
//! Edits for messages that are not loaded are dropped and counted.
//! Every mutation publishes [`MessageEvent::ListChanged`].
//!
//! Optimistic copies sent before the local user is known carry
//! [`PROVISIONAL_SENDER`]. The backend echo cannot fix them (it is a
//! duplicate), so they are re-attributed when the next session reports
//! [`ConnectionEvent::Connected`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use rentwire_proto::event::ReadReceipt;
use rentwire_proto::message::{ConversationId, Message, MessageId, UserId};

use crate::bus::{EventBus, EventHandler};
use crate::event::{ConnectionEvent, ListChange, MessageEvent, SyncEvent};

/// Sender id of optimistic copies sent before the local user is known.
pub const PROVISIONAL_SENDER: &str = "me";

#[derive(Default)]
struct Conversation {
    ids: HashSet<MessageId>,
    messages: Vec<Message>,
}

impl Conversation {
    fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.messages.iter().position(|m| &m.id == id)
    }
}

/// Ordered, deduplicated message lists keyed by conversation.
#[derive(Default)]
pub struct MessageReconciler {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    unattributed: Mutex<Vec<(ConversationId, MessageId)>>,
    discarded: AtomicU64,
}

impl MessageReconciler {
    /// Creates an empty reconciler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an inbound message. Returns whether it was new.
    pub fn receive(&self, message: Message, bus: &EventBus) -> bool {
        let conversation_id = message.conversation_id.clone();
        let id = message.id.clone();
        let inserted = self
            .conversations
            .write()
            .entry(conversation_id.clone())
            .or_default()
            .insert(message);
        if inserted {
            announce(bus, conversation_id, ListChange::Inserted(id));
        } else {
            tracing::trace!(message_id = %id, "duplicate message ignored");
        }
        inserted
    }

    /// Inserts the provisional copy of a locally sent message. The backend
    /// echo with the same id is then a duplicate.
    pub fn insert_local(&self, message: Message, bus: &EventBus) -> bool {
        let key = (message.sender_id.as_str() == PROVISIONAL_SENDER)
            .then(|| (message.conversation_id.clone(), message.id.clone()));
        let inserted = self.receive(message, bus);
        if let Some(key) = key.filter(|_| inserted) {
            self.unattributed.lock().push(key);
        }
        inserted
    }

    /// Stamps `user` on every optimistic copy still carrying
    /// [`PROVISIONAL_SENDER`]. Returns how many changed.
    pub fn attribute(&self, user: &UserId, bus: &EventBus) -> usize {
        let pending = std::mem::take(&mut *self.unattributed.lock());
        if pending.is_empty() {
            return 0;
        }
        let mut changed = Vec::new();
        {
            let mut conversations = self.conversations.write();
            for (conversation_id, id) in pending {
                let Some(conversation) = conversations.get_mut(&conversation_id) else {
                    continue;
                };
                if let Some(at) = conversation.position(&id) {
                    let message = &mut conversation.messages[at];
                    if message.sender_id.as_str() == PROVISIONAL_SENDER {
                        message.sender_id = user.clone();
                        changed.push((conversation_id, id));
                    }
                }
            }
        }
        tracing::debug!(user_id = %user, count = changed.len(), "provisional messages attributed");
        let count = changed.len();
        for (conversation_id, id) in changed {
            announce(bus, conversation_id, ListChange::Updated(id));
        }
        count
    }

    /// Applies an edit in place. Edits for unknown messages are discarded.
    pub fn edit(&self, edited: Message, bus: &EventBus) -> bool {
        let conversation_id = edited.conversation_id.clone();
        let id = edited.id.clone();
        let applied = {
            let mut conversations = self.conversations.write();
            let Some(conversation) = conversations.get_mut(&conversation_id) else {
                self.discard(&id);
                return false;
            };
            match conversation.position(&id) {
                Some(at) if conversation.messages[at].created_at == edited.created_at => {
                    conversation.messages[at] = edited;
                    true
                }
                Some(at) => {
                    // Timestamp moved: re-place it.
                    conversation.messages.remove(at);
                    conversation.ids.remove(&id);
                    conversation.insert(edited);
                    true
                }
                None => false,
            }
        };
        if applied {
            announce(bus, conversation_id, ListChange::Updated(id));
        } else {
            self.discard(&id);
        }
        applied
    }

    /// Marks every message not sent by the reader as read. Returns how many
    /// flipped.
    pub fn mark_read(&self, receipt: &ReadReceipt, bus: &EventBus) -> usize {
        let count = {
            let mut conversations = self.conversations.write();
            let Some(conversation) = conversations.get_mut(&receipt.conversation_id) else {
                return 0;
            };
            let mut count = 0;
            for message in &mut conversation.messages {
                if message.sender_id != receipt.read_by && !message.is_read {
                    message.is_read = true;
                    count += 1;
                }
            }
            count
        };
        if count > 0 {
            announce(
                bus,
                receipt.conversation_id.clone(),
                ListChange::Read { count },
            );
        }
        count
    }

    /// Merges a fetched history page. Returns how many messages were new.
    ///
    /// Messages belonging to another conversation are skipped.
    pub fn merge_page(
        &self,
        conversation_id: &ConversationId,
        page: Vec<Message>,
        bus: &EventBus,
    ) -> usize {
        let inserted = {
            let mut conversations = self.conversations.write();
            let conversation = conversations.entry(conversation_id.clone()).or_default();
            page.into_iter()
                .filter(|m| &m.conversation_id == conversation_id)
                .filter(|m| conversation.insert(m.clone()))
                .count()
        };
        tracing::debug!(conversation = %conversation_id, inserted, "history page merged");
        if inserted > 0 {
            announce(
                bus,
                conversation_id.clone(),
                ListChange::PageMerged { inserted },
            );
        }
        inserted
    }

    /// Removes a message after the backend acknowledged its deletion.
    pub fn remove(&self, conversation_id: &ConversationId, id: &MessageId, bus: &EventBus) -> bool {
        let removed = {
            let mut conversations = self.conversations.write();
            conversations.get_mut(conversation_id).is_some_and(|c| {
                c.position(id).is_some_and(|at| {
                    c.messages.remove(at);
                    c.ids.remove(id);
                    true
                })
            })
        };
        if removed {
            announce(bus, conversation_id.clone(), ListChange::Removed(id.clone()));
        }
        removed
    }

    /// Snapshot of a conversation, oldest first.
    #[must_use]
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.conversations
            .read()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Looks up one message.
    #[must_use]
    pub fn get(&self, conversation_id: &ConversationId, id: &MessageId) -> Option<Message> {
        let conversations = self.conversations.read();
        let conversation = conversations.get(conversation_id)?;
        conversation
            .position(id)
            .map(|at| conversation.messages[at].clone())
    }

    /// Number of edits dropped because their message was not loaded.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Forgets every conversation.
    pub fn clear(&self) {
        self.conversations.write().clear();
        self.unattributed.lock().clear();
    }

    fn discard(&self, id: &MessageId) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(message_id = %id, "edit for unknown message discarded");
    }
}

fn announce(bus: &EventBus, conversation_id: ConversationId, change: ListChange) {
    bus.publish(SyncEvent::Message(MessageEvent::ListChanged {
        conversation_id,
        change,
    }));
}

impl EventHandler for MessageReconciler {
    fn handle(&self, event: &SyncEvent, bus: &EventBus) {
        match event {
            SyncEvent::Message(MessageEvent::Received(message)) => {
                self.receive(message.clone(), bus);
            }
            SyncEvent::Message(MessageEvent::Edited(message)) => {
                self.edit(message.clone(), bus);
            }
            SyncEvent::Message(MessageEvent::Read(receipt)) => {
                self.mark_read(receipt, bus);
            }
            SyncEvent::Connection(ConnectionEvent::Connected { user_id }) => {
                self.attribute(user_id, bus);
            }
            _ => {}
        }
    }
}
