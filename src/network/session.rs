//! Client Session Registry
//!
//! Tracks every open connection: its outbound channel, its authenticated
//! identity (if any) and when it was last heard from. Identity is bound per
//! connection, so one player may watch from several connections.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::game::ledger::PlayerProfile;
use crate::network::protocol::ServerMessage;

/// Connection identifier, unique for the life of the process.
pub type ConnectionId = u64;

/// A frame queued for one connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Message for this connection only.
    Message(ServerMessage),
    /// Pre-serialized JSON shared by every recipient of a broadcast.
    Encoded(Arc<str>),
}

impl Outbound {
    /// Text payload for the WebSocket frame.
    pub fn into_text(self) -> Result<String, serde_json::Error> {
        match self {
            Outbound::Message(msg) => msg.to_json(),
            Outbound::Encoded(text) => Ok(text.to_string()),
        }
    }
}

/// One open connection.
#[derive(Debug)]
pub struct ClientSession {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer address.
    pub addr: Option<SocketAddr>,
    /// Identity bound by a successful auth.
    pub profile: Option<PlayerProfile>,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Last inbound message.
    pub last_activity: Instant,
    sender: mpsc::Sender<Outbound>,
    kick: Option<oneshot::Sender<()>>,
}

/// Result of a broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued for.
    pub delivered: usize,
    /// Connections whose queue was full; they missed this frame.
    pub lagging: Vec<ConnectionId>,
}

/// All open connections.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<BTreeMap<ConnectionId, ClientSession>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection. The returned receiver fires if the connection is
    /// evicted.
    pub async fn register(
        &self,
        addr: Option<SocketAddr>,
        sender: mpsc::Sender<Outbound>,
    ) -> (ConnectionId, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (kick_tx, kick_rx) = oneshot::channel();
        let now = Instant::now();

        self.clients.write().await.insert(
            id,
            ClientSession {
                id,
                addr,
                profile: None,
                connected_at: now,
                last_activity: now,
                sender,
                kick: Some(kick_tx),
            },
        );
        (id, kick_rx)
    }

    /// Remove a connection.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ClientSession> {
        self.clients.write().await.remove(&id)
    }

    /// Attach an authenticated identity. Returns false for unknown connections.
    pub async fn bind_identity(&self, id: ConnectionId, profile: PlayerProfile) -> bool {
        match self.clients.write().await.get_mut(&id) {
            Some(client) => {
                client.profile = Some(profile);
                true
            }
            None => false,
        }
    }

    /// Identity bound to a connection.
    pub async fn identity(&self, id: ConnectionId) -> Option<PlayerProfile> {
        self.clients
            .read()
            .await
            .get(&id)
            .and_then(|c| c.profile.clone())
    }

    /// Record inbound activity.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(client) = self.clients.write().await.get_mut(&id) {
            client.last_activity = Instant::now();
        }
    }

    /// Queue a frame for one connection without waiting.
    pub async fn send_to(&self, id: ConnectionId, frame: Outbound) -> bool {
        match self.clients.read().await.get(&id) {
            Some(client) => client.sender.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Sender for one connection, for deliveries that may wait for space.
    pub async fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.clients.read().await.get(&id).map(|c| c.sender.clone())
    }

    /// Queue a shared frame for every connection without waiting.
    pub async fn broadcast(&self, frame: Arc<str>) -> BroadcastReport {
        let clients = self.clients.read().await;
        let mut report = BroadcastReport::default();

        for (id, client) in clients.iter() {
            match client.sender.try_send(Outbound::Encoded(frame.clone())) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => report.lagging.push(*id),
                // Connection task is exiting and will unregister itself.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        report
    }

    /// Signal every connection idle for longer than `timeout` to close.
    pub async fn evict_idle(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let mut clients = self.clients.write().await;
        let mut evicted = Vec::new();

        for (id, client) in clients.iter_mut() {
            if now.duration_since(client.last_activity) >= timeout {
                if let Some(kick) = client.kick.take() {
                    let _ = kick.send(());
                    evicted.push(*id);
                }
            }
        }
        evicted
    }

    /// Open connections.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// No open connections.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Connections with a bound identity.
    pub async fn authenticated_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.profile.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::PlayerId;

    fn profile() -> PlayerProfile {
        PlayerProfile::new(PlayerId::new([1; 16]), "alice", None)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let (a, _) = registry.register(None, tx.clone()).await;
        let (b, _) = registry.register(None, tx).await;

        assert_ne!(a, b);
        assert_eq!(registry.len().await, 2);
        assert!(registry.unregister(a).await.is_some());
        assert!(registry.unregister(a).await.is_none());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_identity_binding() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let (id, _) = registry.register(None, tx).await;

        assert!(registry.identity(id).await.is_none());
        assert!(registry.bind_identity(id, profile()).await);
        assert_eq!(registry.identity(id).await, Some(profile()));
        assert_eq!(registry.authenticated_count().await, 1);
        assert!(!registry.bind_identity(999, profile()).await);
    }

    #[tokio::test]
    async fn test_broadcast_reports_full_queues() {
        let registry = ClientRegistry::new();
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        registry.register(None, fast_tx).await;
        let (slow, _) = registry.register(None, slow_tx).await;

        let first = registry.broadcast(Arc::from("one")).await;
        assert_eq!(first.delivered, 2);
        assert!(first.lagging.is_empty());

        let second = registry.broadcast(Arc::from("two")).await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.lagging, vec![slow]);

        let text = fast_rx.recv().await.unwrap().into_text().unwrap();
        assert_eq!(text, "one");
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let (id, kick) = registry.register(None, tx).await;

        assert!(registry.evict_idle(Duration::from_secs(300)).await.is_empty());
        assert_eq!(registry.evict_idle(Duration::ZERO).await, vec![id]);
        assert!(kick.await.is_ok());
        // Already signalled.
        assert!(registry.evict_idle(Duration::ZERO).await.is_empty());
    }
}
