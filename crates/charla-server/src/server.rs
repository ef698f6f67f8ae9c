//! TCP listener and top-level server wiring.
//!
//! This module:
//! - Binds the configured address/port.
//! - Accepts new TCP connections and registers each one with the client
//!   registry (connections over capacity are closed immediately).
//! - Spawns one service task per registered connection.
//! - On shutdown: stops accepting, drains the client registry, then tears
//!   the registries down.
//!
//! The per-connection logic lives in `service`, mailbox delivery in
//! `delivery`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use charla_core::MailboxFactory;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::config::Config;
use crate::context::ServerContext;
use crate::service::serve;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Bind the listener and build fresh registries.
    pub async fn bind(config: &Config) -> Result<Self> {
        Server::bind_with(config, Arc::new(ServerContext::new(config))).await
    }

    /// Bind the listener using custom mailboxes.
    pub async fn bind_with_mailboxes(config: &Config, mailboxes: Arc<dyn MailboxFactory>) -> Result<Self> {
        let ctx = ServerContext::with_mailboxes(config, mailboxes);
        Server::bind_with(config, Arc::new(ctx)).await
    }

    async fn bind_with(config: &Config, ctx: Arc<ServerContext>) -> Result<Self> {
        let addr = config.socket_addr_string();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        info!(addr = %listener.local_addr()?, max_clients = config.max_clients, "listening");
        Ok(Server { listener, ctx })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared state, for inspection while the server runs.
    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept connections until `shutdown` resolves, then drain and tear down.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.accept(stream, peer_addr),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!("shutdown requested, no longer accepting connections");
        drop(self.listener);

        self.ctx.clients.shutdown_and_drain().await;
        self.ctx.teardown();
        info!("server terminated");
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer_addr, error = %e, "could not set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let client = match self.ctx.clients.register(writer, Some(peer_addr)) {
            Ok(client) => client,
            Err(e) => {
                // Dropping both halves closes the connection.
                warn!(%peer_addr, error = %e, "rejecting connection");
                return;
            }
        };

        info!(client = %client.id(), %peer_addr, "accepted connection");
        tokio::spawn(serve(Arc::clone(&self.ctx), client, reader));
    }
}

/// Run the server with the given configuration until `shutdown` resolves.
pub async fn run<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    Server::bind(&config).await?.run_until(shutdown).await
}
