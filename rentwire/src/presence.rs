//! Online status and last-seen time per user.
//!
//! Status changes overwrite unconditionally: whichever notice arrives last
//! wins. Notices carry no sequence number, so a stale status delivered out
//! of order around a reconnect can replace a newer one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use rentwire_proto::event::StatusChange;
use rentwire_proto::message::UserId;

use crate::bus::{EventBus, EventHandler};
use crate::event::{PresenceEvent, SyncEvent};

/// A user's last known status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Whether the user is connected.
    pub is_online: bool,
    /// When the user was last seen, if known.
    pub last_seen: Option<DateTime<Utc>>,
}

/// Last-writer-wins presence table.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<HashMap<UserId, PresenceEntry>>,
}

impl PresenceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `change`, replacing whatever was known.
    pub fn apply(&self, change: &StatusChange) {
        tracing::debug!(
            user_id = %change.user_id,
            is_online = change.is_online,
            "presence changed"
        );
        self.entries.write().insert(
            change.user_id.clone(),
            PresenceEntry {
                is_online: change.is_online,
                last_seen: change.last_seen,
            },
        );
    }

    /// Whether `user` is online. Unknown users are offline.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.entries
            .read()
            .get(user)
            .is_some_and(|entry| entry.is_online)
    }

    /// `user`'s status, defaulting to offline with no last-seen time.
    #[must_use]
    pub fn status(&self, user: &UserId) -> PresenceEntry {
        self.entries.read().get(user).cloned().unwrap_or_default()
    }

    /// Users currently online, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_online)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Forgets everyone.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl EventHandler for PresenceRegistry {
    fn handle(&self, event: &SyncEvent, _bus: &EventBus) {
        if let SyncEvent::Presence(PresenceEvent::StatusChanged(change)) = event {
            self.apply(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn change(user: &str, is_online: bool, last_seen: Option<i64>) -> StatusChange {
        StatusChange {
            user_id: UserId::new(user),
            is_online,
            last_seen: last_seen.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        }
    }

    #[test]
    fn unknown_users_default_to_offline() {
        let registry = PresenceRegistry::new();
        let user = UserId::new("ghost");
        assert!(!registry.is_online(&user));
        assert_eq!(registry.status(&user), PresenceEntry::default());
    }

    #[test]
    fn last_writer_wins() {
        let registry = PresenceRegistry::new();
        registry.apply(&change("bob", true, None));
        registry.apply(&change("bob", false, Some(1_700_000_000)));

        let status = registry.status(&UserId::new("bob"));
        assert!(!status.is_online);
        assert_eq!(status.last_seen, Utc.timestamp_opt(1_700_000_000, 0).single());
    }

    #[test]
    fn stale_notice_still_overwrites() {
        let registry = PresenceRegistry::new();
        registry.apply(&change("bob", false, Some(2_000)));
        registry.apply(&change("bob", true, Some(1_000)));
        assert!(registry.is_online(&UserId::new("bob")));
    }

    #[test]
    fn bus_events_update_registry() {
        let registry = std::sync::Arc::new(PresenceRegistry::new());
        let bus = EventBus::new(8);
        bus.register(registry.clone());

        bus.publish(SyncEvent::Presence(PresenceEvent::StatusChanged(change(
            "carol", true, None,
        ))));
        bus.publish(SyncEvent::Presence(PresenceEvent::StatusChanged(change(
            "bob", true, None,
        ))));

        assert_eq!(
            registry.online_users(),
            vec![UserId::new("bob"), UserId::new("carol")]
        );
    }
}
