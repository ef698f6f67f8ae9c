//! Server-side session for one accepted connection.
//!
//! A [`Client`] is shared as `Arc<Client>` between the client registry,
//! the connection's service loop and, while logged in, the mailbox
//! delivery task.
//!
//! Locking:
//! - `io` (async mutex) owns the write half of the connection. Every packet
//!   write and every login/logout transition holds it, so two packets never
//!   interleave and transitions are totally ordered with sends.
//! - `login` (sync mutex) holds the identity and mailbox together, so
//!   readers never see one without the other. It is only written while
//!   `io` is held.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use charla_protocol::{PacketHeader, PacketType, ProtocolError};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ChatError;
use crate::mailbox::{Mailbox, MailboxFactory};
use crate::user::User;
use crate::user_registry::UserRegistry;

/// Write half of a client connection.
pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Identifier for a connected client.
///
/// Unique over the lifetime of the registry that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Login {
    user: Arc<User>,
    mailbox: Arc<Mailbox>,
}

struct ClientIo {
    writer: Option<ClientWriter>,
}

pub struct Client {
    id: ClientId,
    peer_addr: Option<SocketAddr>,
    io: tokio::sync::Mutex<ClientIo>,
    login: Mutex<Option<Login>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("handle", &self.handle())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Client {
    pub(crate) fn new(id: ClientId, peer_addr: Option<SocketAddr>, writer: ClientWriter) -> Self {
        Client {
            id,
            peer_addr,
            io: tokio::sync::Mutex::new(ClientIo {
                writer: Some(writer),
            }),
            login: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    // -------------------------------------------------------------------------
    // Login state
    // -------------------------------------------------------------------------

    /// Log this session in under `handle`.
    ///
    /// On success the session holds one identity reference and the new
    /// mailbox; the mailbox is also returned so the caller can start
    /// delivering from it. If the mailbox cannot be created the identity
    /// reference taken here is returned to `users` and the session stays
    /// logged out.
    pub async fn login(
        &self,
        handle: &str,
        users: &UserRegistry,
        mailboxes: &dyn MailboxFactory,
    ) -> Result<Arc<Mailbox>, ChatError> {
        let _io = self.io.lock().await;

        if self.login.lock().is_some() {
            return Err(ChatError::AlreadyLoggedIn);
        }

        let user = users
            .register_or_get(handle)
            .map_err(|e| ChatError::RegistrationFailed {
                handle: handle.to_string(),
                source: Box::new(e),
            })?;

        let mailbox = match mailboxes.create(handle) {
            Ok(mailbox) => mailbox,
            Err(source) => {
                drop(user);
                users.unregister(handle);
                return Err(ChatError::MailboxFailed {
                    handle: handle.to_string(),
                    source,
                });
            }
        };

        *self.login.lock() = Some(Login {
            user,
            mailbox: Arc::clone(&mailbox),
        });
        info!(client = %self.id, handle, "logged in");
        Ok(mailbox)
    }

    /// Log this session out.
    ///
    /// Returns the identity to `users`, shuts the mailbox down (so no
    /// further deliveries are accepted) and releases it.
    pub async fn logout(&self, users: &UserRegistry) -> Result<(), ChatError> {
        let _io = self.io.lock().await;

        let Some(Login { user, mailbox }) = self.login.lock().take() else {
            return Err(ChatError::NotLoggedIn);
        };

        let handle = user.handle().to_string();
        drop(user);
        users.unregister(&handle);
        mailbox.shutdown();
        drop(mailbox);

        info!(client = %self.id, handle, "logged out");
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        self.login.lock().is_some()
    }

    /// Identity of the logged-in user, if any.
    pub fn user(&self) -> Option<Arc<User>> {
        self.login.lock().as_ref().map(|l| Arc::clone(&l.user))
    }

    /// Mailbox of the logged-in user, if any.
    pub fn mailbox(&self) -> Option<Arc<Mailbox>> {
        self.login.lock().as_ref().map(|l| Arc::clone(&l.mailbox))
    }

    pub fn handle(&self) -> Option<String> {
        self.login
            .lock()
            .as_ref()
            .map(|l| l.user.handle().to_string())
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Write one packet to this client.
    ///
    /// Only logged-in sessions with an open connection can be sent to. A
    /// failure here means the connection is unusable. A send blocked on a
    /// stalled peer is aborted by [`Client::shutdown`].
    pub async fn send_packet(&self, header: &PacketHeader, payload: &[u8]) -> Result<(), ChatError> {
        let mut io = self.io.lock().await;

        let Some(writer) = io.writer.as_mut() else {
            return Err(ProtocolError::ConnectionClosed.into());
        };
        if !self.is_logged_in() {
            return Err(ChatError::NotLoggedIn);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(ChatError::Io(ProtocolError::ConnectionClosed)),
            res = charla_protocol::send_packet(writer, header, payload) => {
                res.map_err(ChatError::from)
            }
        }
    }

    /// Acknowledge request `msgid`, optionally with a payload.
    pub async fn send_ack(&self, msgid: u32, payload: &[u8]) -> Result<(), ChatError> {
        let header = PacketHeader::new(PacketType::Ack, msgid, payload_len(payload)?);
        self.send_packet(&header, payload).await
    }

    /// Refuse request `msgid`.
    pub async fn send_nack(&self, msgid: u32) -> Result<(), ChatError> {
        self.send_packet(&PacketHeader::empty(PacketType::Nack, msgid), &[])
            .await
    }

    // -------------------------------------------------------------------------
    // Connection lifetime
    // -------------------------------------------------------------------------

    /// Ask the connection to wind down.
    ///
    /// The service loop sees this like EOF on its next (or pending) read;
    /// pending and future sends fail.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(client = %self.id, "shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once [`Client::shutdown`] has been called.
    pub async fn wait_shutdown(&self) {
        self.shutdown.cancelled().await
    }

    /// Shut down and release the write half of the connection.
    pub async fn close(&self) {
        self.shutdown();
        let writer = self.io.lock().await.writer.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(client = %self.id, error = %e, "error closing connection");
            }
        }
    }
}

fn payload_len(payload: &[u8]) -> Result<u32, ChatError> {
    u32::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge(u32::MAX).into())
}
