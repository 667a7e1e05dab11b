//! Process-wide duplicate-work guard (spec §4.4).
//!
//! A concurrent map from work-item key (bag name, generic-file identifier,
//! ...) to the broker message id currently processing it. Prevents two
//! workers from double-processing the same item when the broker redelivers
//! a message because a worker failed to `touch` it in time.

use std::collections::HashMap;
use std::sync::RwLock;

/// Guarded by a reader/writer lock per spec §4.4.
#[derive(Default)]
pub struct InFlightRegistry {
    inner: RwLock<HashMap<String, String>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to claim `key` for `message_id`. Returns `true` if this call
    /// won the claim (or already held it under the same message id),
    /// `false` if another message id is already processing this key — the
    /// caller should ack-and-drop its duplicate message in that case.
    pub fn register(&self, key: &str, message_id: &str) -> bool {
        let mut map = self.inner.write().unwrap();
        match map.get(key) {
            Some(existing) if existing != message_id => false,
            _ => {
                map.insert(key.to_string(), message_id.to_string());
                true
            }
        }
    }

    /// Release `key`, allowing a future message to claim it. Called on
    /// terminal success or terminal failure.
    pub fn unregister(&self, key: &str) {
        self.inner.write().unwrap().remove(key);
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
