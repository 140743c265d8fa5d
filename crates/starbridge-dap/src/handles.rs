use std::collections::HashMap;

use thiserror::Error;

use starbridge_wire::ThreadId;

/// Opaque positive integer handed to the editor in place of a richer value.
pub type Handle = i64;

/// Handle reported for values the editor must not try to expand.
pub const NO_HANDLE: Handle = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("unknown handle {0}")]
    NotFound(Handle),
}

/// Auto-incrementing table from handle to value.
///
/// Handles start at 1 and are never reused, even across [`clear`], so a stale
/// handle from before a resume can only miss, never alias a fresh entry.
///
/// [`clear`]: HandleRegistry::clear
#[derive(Debug)]
pub struct HandleRegistry<T> {
    next: Handle,
    map: HashMap<Handle, T>,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
        }
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, value: T) -> Handle {
        self.next += 1;
        let handle = self.next;
        self.map.insert(handle, value);
        handle
    }

    pub fn get(&self, handle: Handle) -> Result<&T, HandleError> {
        self.map.get(&handle).ok_or(HandleError::NotFound(handle))
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// A registry entry together with the thread whose debug state it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadBound<T> {
    pub thread_id: ThreadId,
    pub value: T,
}

impl<T> ThreadBound<T> {
    pub fn new(thread_id: ThreadId, value: T) -> Self {
        Self { thread_id, value }
    }
}
