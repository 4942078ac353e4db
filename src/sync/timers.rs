//! Keyed one-shot timers with cancel-on-supersede semantics.
//!
//! Scheduling a key that already has a timer aborts the old one. A timer
//! claims its slot before running its action, so a timer that lost the
//! race to a newer schedule or a cancel never runs.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Registry of pending timers keyed by `K`.
pub struct TimerRegistry<K> {
    name: &'static str,
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    next_generation: AtomicU64,
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    /// Create an empty registry; `name` labels trace output.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Run `action` after `delay` unless superseded or cancelled first.
    ///
    /// Replaces (and aborts) any timer already pending for `key`.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let claim_key = key.clone();
        let name = self.name;

        // Held across the spawn so the task cannot claim before it is registered.
        let mut guard = lock(&self.slots);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let claimed = {
                let mut slots = lock(&slots);
                match slots.get(&claim_key) {
                    Some(slot) if slot.generation == generation => {
                        slots.remove(&claim_key);
                        true
                    }
                    _ => false,
                }
            };
            if claimed {
                trace!(timer = name, key = ?claim_key, "timer fired");
                action().await;
            }
        });

        if let Some(previous) = guard.insert(key, Slot { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel the pending timer for `key`; returns whether one existed.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = lock(&self.slots).remove(key);
        match removed {
            Some(slot) => {
                slot.handle.abort();
                trace!(timer = self.name, ?key, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer and return their keys.
    pub fn cancel_all(&self) -> Vec<K> {
        let drained: Vec<(K, Slot)> = lock(&self.slots).drain().collect();
        drained
            .into_iter()
            .map(|(key, slot)| {
                slot.handle.abort();
                key
            })
            .collect()
    }

    /// Whether a timer is pending for `key`.
    #[must_use]
    pub fn is_scheduled(&self, key: &K) -> bool {
        lock(&self.slots).contains_key(key)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for TimerRegistry<K> {
    fn drop(&mut self) {
        for (_, slot) in lock(&self.slots).drain() {
            slot.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
