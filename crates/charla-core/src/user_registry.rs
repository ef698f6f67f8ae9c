//! Deduplicated table of logged-in identities.
//!
//! - One [`User`] per distinct handle.
//! - Each successful [`UserRegistry::register_or_get`] owns one logical
//!   reference and must be paired with exactly one
//!   [`UserRegistry::unregister`].
//! - The entry disappears when its last reference is returned.
//!
//! Handles are compared byte-for-byte; no case folding or trimming.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::ChatError;
use crate::user::User;

#[derive(Debug)]
struct Entry {
    user: Arc<User>,
    refs: usize,
}

/// Handle -> identity table.
#[derive(Debug)]
pub struct UserRegistry {
    max_users: usize,
    entries: Mutex<HashMap<String, Entry>>,
}

impl UserRegistry {
    /// Create an empty registry holding at most `max_users` distinct handles.
    pub fn new(max_users: usize) -> Self {
        UserRegistry {
            max_users,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `handle`, creating the identity if it is not registered yet.
    ///
    /// Fails with [`ChatError::ResourceExhausted`] only when a new entry
    /// would push the table past its limit.
    pub fn register_or_get(&self, handle: &str) -> Result<Arc<User>, ChatError> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(handle) {
            entry.refs += 1;
            debug!(handle, refs = entry.refs, "reusing registered user");
            return Ok(Arc::clone(&entry.user));
        }

        if entries.len() >= self.max_users {
            debug!(handle, max_users = self.max_users, "user registry full");
            return Err(ChatError::ResourceExhausted("user registry full"));
        }

        let user = Arc::new(User::new(handle));
        entries.insert(
            handle.to_string(),
            Entry {
                user: Arc::clone(&user),
                refs: 1,
            },
        );
        debug!(handle, "registered new user");
        Ok(user)
    }

    /// Return one reference to `handle`; the entry is removed once none remain.
    ///
    /// Unknown handles are ignored.
    pub fn unregister(&self, handle: &str) {
        let mut entries = self.entries.lock();

        let Some(entry) = entries.get_mut(handle) else {
            debug!(handle, "unregister of unknown handle ignored");
            return;
        };

        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(handle);
            debug!(handle, "user unregistered");
        } else {
            debug!(handle, refs = entry.refs, "user still referenced");
        }
    }

    /// The registered identity for `handle`, without taking a reference.
    pub fn get(&self, handle: &str) -> Option<Arc<User>> {
        self.entries
            .lock()
            .get(handle)
            .map(|entry| Arc::clone(&entry.user))
    }

    /// Number of outstanding references to `handle`.
    pub fn ref_count(&self, handle: &str) -> Option<usize> {
        self.entries.lock().get(handle).map(|entry| entry.refs)
    }

    /// All registered handles, sorted.
    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.entries.lock().keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry; used once at server teardown.
    ///
    /// Returns how many entries were still present.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.lock();
        let leftover = entries.len();
        entries.clear();
        leftover
    }
}
