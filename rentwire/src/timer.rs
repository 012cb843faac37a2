//! Keyed, cancellable one-shot timers.
//!
//! Each key has at most one armed timer. Scheduling a key that is already
//! armed cancels the previous timer first. A timer that was replaced or
//! cancelled after its sleep finished but before it claimed its slot does
//! not fire: the callback only runs if the armed id still matches.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

struct Armed {
    id: u64,
    handle: JoinHandle<()>,
}

struct TimerTable<K> {
    next_id: u64,
    armed: HashMap<K, Armed>,
}

/// A set of timers keyed by `K`. Cloning yields another handle to the same set.
pub struct Timers<K> {
    table: Arc<Mutex<TimerTable<K>>>,
}

impl<K> Clone for Timers<K> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
        }
    }
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable {
                next_id: 0,
                armed: HashMap::new(),
            })),
        }
    }
}

impl<K> Timers<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    /// Creates an empty timer set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `key` to run `on_fire` after `after`, replacing any armed timer.
    /// Returns whether a timer was replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, key: K, after: Duration, on_fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;

        let timers = self.clone();
        let fire_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if timers.complete(&fire_key, id) {
                on_fire();
            }
        });

        table
            .armed
            .insert(key, Armed { id, handle })
            .is_some_and(|previous| {
                previous.handle.abort();
                true
            })
    }

    /// Disarms `key`. Returns whether a timer was armed.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.table.lock().armed.remove(key);
        removed.is_some_and(|armed| {
            armed.handle.abort();
            true
        })
    }

    /// Disarms every timer.
    pub fn cancel_all(&self) {
        let mut table = self.table.lock();
        for (_, armed) in table.armed.drain() {
            armed.handle.abort();
        }
    }

    /// Whether `key` has an armed timer.
    #[must_use]
    pub fn is_armed(&self, key: &K) -> bool {
        self.table.lock().armed.contains_key(key)
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().armed.len()
    }

    /// Whether no timer is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claims the slot for a timer that finished sleeping. Returns `false`
    /// if the timer was replaced or cancelled in the meantime.
    fn complete(&self, key: &K, id: u64) -> bool {
        let mut table = self.table.lock();
        match table.armed.get(key) {
            Some(armed) if armed.id == id => {
                table.armed.remove(key);
                true
            }
            _ => false,
        }
    }
}
