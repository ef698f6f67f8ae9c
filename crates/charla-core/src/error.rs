//! Error types for the session and registry core.
//!
//! Every failure here is local to one connection or one request; none of
//! them is fatal to the server.

use charla_protocol::ProtocolError;
use thiserror::Error;

use crate::mailbox::MailboxError;

/// Errors returned by the client/user registries and by sessions.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A bounded table could not take another entry.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The client registry already holds `capacity` sessions.
    #[error("client registry full ({capacity} connections)")]
    CapacityExceeded { capacity: usize },

    #[error("session is already logged in")]
    AlreadyLoggedIn,

    #[error("session is not logged in")]
    NotLoggedIn,

    /// The user registry refused the handle.
    #[error("could not register handle {handle:?}")]
    RegistrationFailed {
        handle: String,
        #[source]
        source: Box<ChatError>,
    },

    /// The mailbox factory refused to create a mailbox.
    #[error("could not create mailbox for {handle:?}")]
    MailboxFailed {
        handle: String,
        #[source]
        source: MailboxError,
    },

    /// The session is not (or no longer) in the client registry.
    #[error("client is not registered")]
    NotFound,

    /// Short count or transport failure; the connection is unusable.
    #[error(transparent)]
    Io(#[from] ProtocolError),
}
