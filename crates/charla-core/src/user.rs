//! Identity of a logged-in user.

use std::fmt;

/// One logged-in handle, shared by every session using it.
///
/// The handle never changes after creation. Sharing is by `Arc<User>`;
/// the number of logins holding the identity is tracked by
/// [`UserRegistry`](crate::UserRegistry).
#[derive(Debug, PartialEq, Eq)]
pub struct User {
    handle: String,
}

impl User {
    pub(crate) fn new(handle: impl Into<String>) -> Self {
        User {
            handle: handle.into(),
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.handle)
    }
}
