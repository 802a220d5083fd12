use std::sync::Mutex;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;
use crate::message_id::MessageId;

/// Remembers the ids of recently completed messages. Fragments of these messages can still
///  arrive (the sender retries until it sees an ack for each fragment), and they must be
///  acknowledged but not delivered a second time.
pub struct DuplicateCache {
    ttl: Duration,
    completed: Mutex<FxHashMap<MessageId, Instant>>,
}

impl DuplicateCache {
    pub fn new(ttl: Duration) -> DuplicateCache {
        DuplicateCache {
            ttl,
            completed: Default::default(),
        }
    }

    pub fn insert(&self, message_id: MessageId, completed_at: Instant) {
        self.completed.lock().unwrap()
            .insert(message_id, completed_at);
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.completed.lock().unwrap()
            .contains_key(&message_id)
    }

    /// Removes all entries that completed more than the TTL before `now`, returning the
    ///  number of evicted entries
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut completed = self.completed.lock().unwrap();
        let len_before = completed.len();
        completed.retain(|message_id, completed_at| {
            let keep = now.saturating_duration_since(*completed_at) <= self.ttl;
            if !keep {
                trace!("forgetting completed message {}", message_id);
            }
            keep
        });
        len_before - completed.len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.completed.lock().unwrap().len()
    }
}
