//! Bounded registry of live client sessions.
//!
//! The registry:
//! - Creates a [`Client`] for every accepted connection, up to `capacity`.
//! - Keeps one `Arc<Client>` per session until it is unregistered.
//! - Hands out snapshots so callers can act on sessions without holding
//!   the registry lock.
//! - Provides the drain barrier used at shutdown: every session is asked
//!   to shut down, then the caller waits until the last one unregisters.
//!
//! The lock is a plain (non-async) mutex and is never held across an
//! `.await` or any network I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::client::{Client, ClientId};
use crate::error::ChatError;

#[derive(Debug)]
pub struct ClientRegistry {
    capacity: usize,
    clients: Mutex<Vec<Arc<Client>>>,

    /// Current number of registered clients; the drain barrier waits on it.
    population: watch::Sender<usize>,

    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Create an empty registry accepting at most `capacity` clients.
    pub fn new(capacity: usize) -> Self {
        let (population, _) = watch::channel(0);
        ClientRegistry {
            capacity,
            clients: Mutex::new(Vec::with_capacity(capacity)),
            population,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_client_id(&self) -> ClientId {
        ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a new connection, given its write half.
    ///
    /// The registry keeps one reference to the new session and returns
    /// another. When the registry is full the session is dropped (closing
    /// `writer`) and [`ChatError::CapacityExceeded`] is returned.
    pub fn register<W>(&self, writer: W, peer_addr: Option<SocketAddr>) -> Result<Arc<Client>, ChatError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let client = Arc::new(Client::new(
            self.next_client_id(),
            peer_addr,
            Box::new(writer),
        ));

        let mut clients = self.clients.lock();
        if clients.len() >= self.capacity {
            drop(clients);
            debug!(client = %client.id(), capacity = self.capacity, "registry full, rejecting client");
            return Err(ChatError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        clients.push(Arc::clone(&client));
        let count = clients.len();
        self.population.send_replace(count);
        drop(clients);

        debug!(client = %client.id(), count, "client registered");
        Ok(client)
    }

    /// Remove `client` and release the registry's reference to it.
    ///
    /// Removing the last client releases anyone waiting in
    /// [`ClientRegistry::shutdown_and_drain`].
    pub fn unregister(&self, client: &Client) -> Result<(), ChatError> {
        let mut clients = self.clients.lock();

        let Some(index) = clients
            .iter()
            .position(|c| std::ptr::eq(Arc::as_ptr(c), client))
        else {
            return Err(ChatError::NotFound);
        };

        let removed = clients.swap_remove(index);
        let remaining = clients.len();
        self.population.send_replace(remaining);
        drop(clients);
        drop(removed);

        if remaining == 0 {
            debug!(client = %client.id(), "last client unregistered");
        } else {
            debug!(client = %client.id(), remaining, "client unregistered");
        }
        Ok(())
    }

    /// One extra reference to every registered client, taken atomically.
    pub fn snapshot_all(&self) -> Vec<Arc<Client>> {
        self.clients.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resolves once no clients are registered (immediately if already empty).
    pub async fn wait_until_empty(&self) {
        let mut population = self.population.subscribe();
        // The sender lives in `self`, so this only ends through the predicate.
        let _ = population.wait_for(|count| *count == 0).await;
    }

    /// Shut down every registered connection, then wait until all of them
    /// have unregistered.
    ///
    /// Intended to be called once, when the server stops accepting.
    pub async fn shutdown_and_drain(&self) {
        {
            let clients = self.clients.lock();
            info!(clients = clients.len(), "shutting down all clients");
            for client in clients.iter() {
                client.shutdown();
            }
        }

        self.wait_until_empty().await;
        info!("all clients drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::sink;

    #[test]
    fn size_tracks_register_and_unregister() {
        let registry = ClientRegistry::new(4);
        let a = registry.register(sink(), None).unwrap();
        let b = registry.register(sink(), None).unwrap();
        assert_eq!(registry.len(), 2);
        assert_ne!(a.id(), b.id());

        registry.unregister(&a).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(matches!(registry.unregister(&a), Err(ChatError::NotFound)));
        assert_eq!(registry.len(), 1);

        registry.unregister(&b).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn full_registry_rejects_and_stays_unchanged() {
        let registry = ClientRegistry::new(2);
        let a = registry.register(sink(), None).unwrap();
        let _b = registry.register(sink(), None).unwrap();

        let err = registry.register(sink(), None).unwrap_err();
        assert!(matches!(err, ChatError::CapacityExceeded { capacity: 2 }));
        assert_eq!(registry.len(), 2);

        registry.unregister(&a).unwrap();
        registry.register(sink(), None).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_and_caller_hold_separate_references() {
        let registry = ClientRegistry::new(2);
        let client = registry.register(sink(), None).unwrap();
        assert_eq!(Arc::strong_count(&client), 2);

        let snapshot = registry.snapshot_all();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(Arc::strong_count(&client), 3);

        registry.unregister(&client).unwrap();
        drop(snapshot);
        assert_eq!(Arc::strong_count(&client), 1);
    }

    #[test]
    fn snapshot_survives_later_unregistration() {
        let registry = ClientRegistry::new(4);
        let a = registry.register(sink(), None).unwrap();
        let b = registry.register(sink(), None).unwrap();

        let snapshot = registry.snapshot_all();
        registry.unregister(&a).unwrap();
        registry.unregister(&b).unwrap();

        let ids: Vec<ClientId> = snapshot.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id()));
        assert!(ids.contains(&b.id()));
    }

    #[tokio::test]
    async fn drain_on_empty_registry_returns_immediately() {
        let registry = ClientRegistry::new(4);
        tokio::time::timeout(Duration::from_secs(1), registry.shutdown_and_drain())
            .await
            .expect("empty registry should drain at once");
    }

    #[tokio::test]
    async fn drain_waits_for_every_client() {
        let registry = Arc::new(ClientRegistry::new(4));
        let mut workers = Vec::new();

        for _ in 0..3 {
            let client = registry.register(sink(), None).unwrap();
            let registry = Arc::clone(&registry);
            workers.push(tokio::spawn(async move {
                client.wait_shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                registry.unregister(&client).unwrap();
            }));
        }

        tokio::time::timeout(Duration::from_secs(2), registry.shutdown_and_drain())
            .await
            .expect("drain should finish once workers unregister");
        assert!(registry.is_empty());

        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test]
    async fn drain_does_not_return_while_a_client_remains() {
        let registry = Arc::new(ClientRegistry::new(4));
        let stubborn = registry.register(sink(), None).unwrap();

        let drained = tokio::time::timeout(
            Duration::from_millis(50),
            registry.shutdown_and_drain(),
        )
        .await;
        assert!(drained.is_err());
        assert!(stubborn.is_shutdown());

        registry.unregister(&stubborn).unwrap();
        tokio::time::timeout(Duration::from_secs(1), registry.wait_until_empty())
            .await
            .expect("registry is empty now");
    }
}
