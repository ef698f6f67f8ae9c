//! charla-core
//!
//! Shared state of the chat server:
//! - client sessions and the bounded client registry
//! - user identities and the deduplicating user registry
//! - per-login mailboxes
//!
//! Nothing here owns a socket listener; the server crate accepts
//! connections and hands their write halves to [`ClientRegistry::register`].

pub mod error;
pub mod user;
pub mod user_registry;
pub mod mailbox;
pub mod client;
pub mod client_registry;

pub use client::{Client, ClientId, ClientWriter};
pub use client_registry::ClientRegistry;
pub use error::ChatError;
pub use mailbox::{
    DiscardHook, LocalMailboxFactory, Mailbox, MailboxEntry, MailboxError, MailboxFactory,
    NoticeKind,
};
pub use user::User;
pub use user_registry::UserRegistry;
