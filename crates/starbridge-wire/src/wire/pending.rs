use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::oneshot;

/// Outstanding requests awaiting a response, keyed by correlation id.
///
/// A key holds at most one resolver. Resolving or removing a key frees it,
/// although callers that allocate ids from a counter never reuse them.
#[derive(Debug)]
pub struct PendingRequests<K, T> {
    waiters: HashMap<K, oneshot::Sender<T>>,
}

impl<K, T> Default for PendingRequests<K, T> {
    fn default() -> Self {
        Self {
            waiters: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash, T> PendingRequests<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolver for `key`.
    ///
    /// Returns `None` if `key` is already pending; the existing waiter is
    /// left in place.
    pub fn register(&mut self, key: K) -> Option<oneshot::Receiver<T>> {
        if self.waiters.contains_key(&key) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key, tx);
        Some(rx)
    }

    /// Deliver `value` to the waiter for `key` and forget it.
    ///
    /// Returns `false` when nobody was waiting (unknown key, or the receiver
    /// was dropped).
    pub fn resolve(&mut self, key: &K, value: T) -> bool {
        match self.waiters.remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.waiters.remove(key).is_some()
    }

    /// Drop every resolver. Waiters observe a closed channel.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub fn contains(&self, key: &K) -> bool {
        self.waiters.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
