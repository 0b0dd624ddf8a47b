//! WebSocket Game Server
//!
//! Async WebSocket server for Crash clients. Accepts connections, decodes
//! frames and hands every message to the gateway with its receive instant.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, broadcast};
use tokio::time::{interval, timeout, Instant};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::network::gateway::BroadcastGateway;
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::network::session::{ClientRegistry, Outbound};
use crate::settlement::LedgerStore;

/// How long queued frames may take to flush when a connection closes.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    /// How often idle connections are looked for.
    pub cleanup_interval: Duration,
    /// Frames queued per connection before broadcasts skip it.
    pub outbound_buffer: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            outbound_buffer: 64,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The game server.
pub struct GameServer<L: LedgerStore> {
    /// Server configuration.
    config: ServerConfig,
    /// Request handling and fan-out.
    gateway: Arc<BroadcastGateway<L>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl<L: LedgerStore> GameServer<L> {
    /// Create a new game server. `shutdown_tx` is shared with the other
    /// long-running tasks.
    pub fn new(
        config: ServerConfig,
        gateway: Arc<BroadcastGateway<L>>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self { config, gateway, shutdown_tx }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Game server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let cleanup_handle = tokio::spawn(Self::run_cleanup_loop(
            self.gateway.registry().clone(),
            self.config.idle_timeout,
            self.config.cleanup_interval,
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.gateway.registry().len().await;
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let gateway = self.gateway.clone();
        let buffer = self.config.outbound_buffer.max(1);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<Outbound>(buffer);

            // Spawn message sender task
            let mut sender_task = tokio::spawn(async move {
                while let Some(frame) = msg_rx.recv().await {
                    let text = match frame.into_text() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let (id, mut kick) = gateway.connect(Some(addr), msg_tx.clone()).await;
            info!(connection = id, "Client {} connected", addr);

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let received_at = Instant::now();
                        let decoded = match msg {
                            Some(Ok(Message::Text(text))) => ClientMessage::from_json(&text)
                                .map_err(|e| e.to_string()),
                            Some(Ok(Message::Binary(data))) => ClientMessage::from_bytes(&data)
                                .map_err(|e| e.to_string()),
                            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                                // tungstenite answers pings itself.
                                gateway.registry().touch(id).await;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        let reply = match decoded {
                            Ok(client_msg) => gateway.handle_message(id, client_msg, received_at).await,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                ServerMessage::error(ErrorCode::InvalidInput, "Invalid message format")
                            }
                        };
                        if msg_tx.send(Outbound::Message(reply)).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut kick => {
                        let _ = msg_tx.send(Outbound::Message(ServerMessage::Shutdown {
                            reason: "Idle timeout".to_string(),
                        })).await;
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(Outbound::Message(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        })).await;
                        break;
                    }
                }
            }

            // Cleanup: drop every sender so the writer drains and closes.
            gateway.disconnect(id).await;
            drop(msg_tx);
            if timeout(FLUSH_TIMEOUT, &mut sender_task).await.is_err() {
                sender_task.abort();
            }

            info!(connection = id, "Client {} cleaned up", addr);
        });
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(
        registry: Arc<ClientRegistry>,
        idle_timeout: Duration,
        every: Duration,
    ) {
        let mut interval = interval(every);

        loop {
            interval.tick().await;

            let evicted = registry.evict_idle(idle_timeout).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Closing idle connections");
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.gateway.registry().len().await
    }
}
