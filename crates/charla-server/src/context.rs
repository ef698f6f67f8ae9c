//! Shared state handed to every connection.
//!
//! This bundles:
//! - the client registry (live connections, drain barrier)
//! - the user registry (logged-in handles)
//! - the mailbox factory used on login
//!
//! One `ServerContext` is built at startup and torn down once, after
//! the client registry has drained.

use std::sync::Arc;

use charla_core::{ClientRegistry, LocalMailboxFactory, MailboxFactory, UserRegistry};
use tracing::{info, warn};

use crate::config::Config;

pub struct ServerContext {
    pub clients: ClientRegistry,
    pub users: UserRegistry,
    pub mailboxes: Arc<dyn MailboxFactory>,
}

impl ServerContext {
    pub fn new(config: &Config) -> Self {
        ServerContext::with_mailboxes(config, Arc::new(LocalMailboxFactory))
    }

    pub fn with_mailboxes(config: &Config, mailboxes: Arc<dyn MailboxFactory>) -> Self {
        ServerContext {
            clients: ClientRegistry::new(config.max_clients),
            users: UserRegistry::new(config.max_users),
            mailboxes,
        }
    }

    /// Final cleanup once every client has unregistered.
    pub fn teardown(&self) {
        let clients = self.clients.len();
        if clients > 0 {
            warn!(clients, "tearing down with clients still registered");
        }

        let users = self.users.clear();
        if users > 0 {
            warn!(users, "dropped users still registered at teardown");
        }

        info!("registries torn down");
    }
}
