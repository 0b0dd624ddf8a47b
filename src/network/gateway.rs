//! Broadcast Gateway
//!
//! Sits between connections and the round driver. Inbound, it binds
//! identities from tokens, checks that a stake is positive and affordable,
//! and forwards requests stamped with their receive instant. Outbound, it
//! fans the driver's snapshots and events out to every connection, encoding
//! each frame once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::ids::RoundId;
use crate::core::multiplier::Multiplier;
use crate::game::ledger::RejectionReason;
use crate::game::round::PhaseKind;
use crate::network::auth::{validate_token, AuthConfig};
use crate::network::driver::{
    PublishedSnapshot, RoundBroadcast, RoundHandle, RoundRequestError, SnapshotReason,
};
use crate::network::protocol::{
    parse_round_id, AuthRequest, AuthResult, CashoutRequest, ClientMessage, ErrorCode,
    JoinRequest, RequestKind, RoundEventMessage, RoundStateUpdate, ServerMessage,
};
use crate::network::session::{ClientRegistry, ConnectionId, Outbound};
use crate::settlement::{LedgerError, LedgerStore};

/// How long a resync snapshot waits for space in a full client queue.
const RESYNC_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// What a running tick shows: round, phase and multiplier.
type TickKey = (RoundId, PhaseKind, Multiplier);

/// Request failures answered with an error frame.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Join or cashout before a successful auth.
    #[error("authenticate before placing bets")]
    NotAuthenticated,

    /// Balance lookup failed.
    #[error("balance check failed: {0}")]
    LedgerUnavailable(LedgerError),

    /// Round driver is gone.
    #[error("round is unavailable")]
    RoundUnavailable,

    /// Malformed request field.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    /// Error frame for the requester.
    pub fn to_message(&self) -> ServerMessage {
        let code = match self {
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::LedgerUnavailable(_) => ErrorCode::LedgerUnavailable,
            Self::RoundUnavailable => ErrorCode::RoundUnavailable,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
        };
        ServerMessage::error(code, self.to_string())
    }
}

/// Connection-facing front of the round.
pub struct BroadcastGateway<L: LedgerStore> {
    round: RoundHandle,
    ledger: L,
    auth: AuthConfig,
    registry: Arc<ClientRegistry>,
    server_version: String,
}

impl<L: LedgerStore> BroadcastGateway<L> {
    /// Create a gateway in front of a running driver.
    pub fn new(round: RoundHandle, ledger: L, auth: AuthConfig, server_version: impl Into<String>) -> Self {
        Self {
            round,
            ledger,
            auth,
            registry: Arc::new(ClientRegistry::new()),
            server_version: server_version.into(),
        }
    }

    /// Open connections.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Register a connection and queue the current snapshot for it.
    pub async fn connect(
        &self,
        addr: Option<SocketAddr>,
        sender: mpsc::Sender<Outbound>,
    ) -> (ConnectionId, oneshot::Receiver<()>) {
        let (id, kick) = self.registry.register(addr, sender).await;
        match self.round.snapshot().await {
            Ok(published) => {
                self.registry.send_to(id, Outbound::Message(snapshot_message(&published))).await;
            }
            Err(e) => warn!(connection = id, error = %e, "No snapshot for new connection"),
        }
        (id, kick)
    }

    /// Drop a connection.
    pub async fn disconnect(&self, id: ConnectionId) {
        if let Some(client) = self.registry.unregister(id).await {
            debug!(
                connection = id,
                authenticated = client.profile.is_some(),
                "Connection removed"
            );
        }
    }

    /// Handle one client message received at `received_at`.
    pub async fn handle_message(
        &self,
        id: ConnectionId,
        msg: ClientMessage,
        received_at: Instant,
    ) -> ServerMessage {
        self.registry.touch(id).await;

        let result = match msg {
            ClientMessage::Auth(req) => Ok(self.handle_auth(id, req).await),
            ClientMessage::Join(req) => self.handle_join(id, req, received_at).await,
            ClientMessage::Cashout(req) => self.handle_cashout(id, req, received_at).await,
            ClientMessage::SyncRequest => self.resync().await,
            ClientMessage::Ping { timestamp } => Ok(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
            }),
        };
        result.unwrap_or_else(|e| e.to_message())
    }

    async fn handle_auth(&self, id: ConnectionId, req: AuthRequest) -> ServerMessage {
        match validate_token(&req.token, &self.auth) {
            Ok(claims) => {
                let profile = claims.profile();
                info!(
                    connection = id,
                    player = %profile.player_id.short(),
                    client_version = %req.client_version,
                    "Client authenticated"
                );
                let result = AuthResult {
                    success: true,
                    player_id: Some(profile.player_id.to_uuid_string()),
                    display_name: Some(profile.display_name.clone()),
                    error: None,
                    server_version: self.server_version.clone(),
                };
                self.registry.bind_identity(id, profile).await;
                ServerMessage::AuthResult(result)
            }
            Err(e) => {
                warn!(connection = id, error = %e, "Authentication failed");
                ServerMessage::AuthResult(AuthResult {
                    success: false,
                    player_id: None,
                    display_name: None,
                    error: Some(e.to_string()),
                    server_version: self.server_version.clone(),
                })
            }
        }
    }

    async fn handle_join(
        &self,
        id: ConnectionId,
        req: JoinRequest,
        received_at: Instant,
    ) -> Result<ServerMessage, GatewayError> {
        let profile = self.registry.identity(id).await.ok_or(GatewayError::NotAuthenticated)?;
        let round_id = parse_requested_round(req.round_id.as_deref())?;
        let auto_cashout = match req.auto_cashout {
            Some(target) if !target.is_finite() => {
                return Err(GatewayError::InvalidInput("auto_cashout must be a number".into()));
            }
            target => target.map(Multiplier::from_f64_floor),
        };

        if req.stake <= 0 {
            let reason = RejectionReason::invalid_stake(req.stake, "stake must be positive");
            return Ok(ServerMessage::rejected(RequestKind::Join, &reason));
        }

        let balance = match self.ledger.get_balance(profile.player_id).await {
            Ok(balance) => balance,
            Err(LedgerError::UnknownPlayer(_)) => 0,
            Err(e) => return Err(GatewayError::LedgerUnavailable(e)),
        };
        if balance < req.stake {
            let reason = RejectionReason::invalid_stake(
                req.stake,
                format!("insufficient balance ({})", balance),
            );
            return Ok(ServerMessage::rejected(RequestKind::Join, &reason));
        }

        match self.round.join(profile, req.stake, auto_cashout, round_id, received_at).await {
            Ok(accepted) => Ok(ServerMessage::JoinAccepted {
                round_id: accepted.round_id.to_uuid_string(),
                stake: accepted.bet.stake,
                auto_cashout: accepted.bet.auto_cashout.map(Multiplier::as_f64),
            }),
            Err(RoundRequestError::Rejected(reason)) => {
                Ok(ServerMessage::rejected(RequestKind::Join, &reason))
            }
            Err(RoundRequestError::DriverStopped) => Err(GatewayError::RoundUnavailable),
        }
    }

    async fn handle_cashout(
        &self,
        id: ConnectionId,
        req: CashoutRequest,
        received_at: Instant,
    ) -> Result<ServerMessage, GatewayError> {
        let profile = self.registry.identity(id).await.ok_or(GatewayError::NotAuthenticated)?;
        let round_id = parse_requested_round(req.round_id.as_deref())?;

        match self.round.cashout(profile.player_id, round_id, received_at).await {
            Ok(accepted) => {
                let multiplier = accepted.bet.cashout.unwrap_or(Multiplier::ONE);
                Ok(ServerMessage::CashoutAccepted {
                    round_id: accepted.round_id.to_uuid_string(),
                    multiplier: multiplier.as_f64(),
                    payout: multiplier.payout(accepted.bet.stake),
                })
            }
            Err(RoundRequestError::Rejected(reason)) => {
                Ok(ServerMessage::rejected(RequestKind::Cashout, &reason))
            }
            Err(RoundRequestError::DriverStopped) => Err(GatewayError::RoundUnavailable),
        }
    }

    async fn resync(&self) -> Result<ServerMessage, GatewayError> {
        let published = self.round.snapshot().await.map_err(|_| GatewayError::RoundUnavailable)?;
        Ok(snapshot_message(&published))
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Forward driver broadcasts to every connection until the driver stops.
    ///
    /// Running ticks that would repeat the last multiplier sent are dropped.
    /// Connections that miss a frame get a fresh snapshot.
    pub fn spawn_fanout(&self) -> JoinHandle<()> {
        let round = self.round.clone();
        let registry = self.registry.clone();
        let mut rx = round.subscribe();

        tokio::spawn(async move {
            let mut last_sent: Option<TickKey> = None;

            loop {
                let msg = match rx.recv().await {
                    Ok(RoundBroadcast::Snapshot(published)) => {
                        if !should_send(last_sent, &published) {
                            continue;
                        }
                        last_sent = Some(tick_key(&published));
                        snapshot_message(&published)
                    }
                    Ok(RoundBroadcast::Event(event)) => {
                        ServerMessage::Event(RoundEventMessage::from(event.as_ref()))
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fan-out fell behind the round driver, resyncing");
                        match round.snapshot().await {
                            Ok(published) => snapshot_message(&published),
                            Err(_) => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };

                let text: Arc<str> = match msg.to_json() {
                    Ok(text) => Arc::from(text),
                    Err(e) => {
                        error!(error = %e, "Failed to encode broadcast");
                        continue;
                    }
                };

                let report = registry.broadcast(text).await;
                if !report.lagging.is_empty() {
                    resync_lagging(&round, &registry, report.lagging).await;
                }
            }

            info!("Fan-out stopped");
        })
    }
}

fn parse_requested_round(raw: Option<&str>) -> Result<Option<RoundId>, GatewayError> {
    parse_round_id(raw).map_err(|e| GatewayError::InvalidInput(e.to_string()))
}

fn tick_key(published: &PublishedSnapshot) -> TickKey {
    let snap = &published.snapshot;
    (snap.round_id, snap.phase, snap.current_multiplier)
}

/// Ticks that repeat the last multiplier sent are coalesced away. Every
/// other snapshot carries state a tick does not, so it always goes out.
fn should_send(last_sent: Option<TickKey>, published: &PublishedSnapshot) -> bool {
    published.reason != SnapshotReason::Tick || last_sent != Some(tick_key(published))
}

fn snapshot_message(published: &PublishedSnapshot) -> ServerMessage {
    ServerMessage::Snapshot(RoundStateUpdate::from_snapshot(published.seq, &published.snapshot))
}

/// Queue a fresh snapshot for connections that missed a frame, waiting for
/// queue space on a separate task.
async fn resync_lagging(round: &RoundHandle, registry: &ClientRegistry, lagging: Vec<ConnectionId>) {
    let published = match round.snapshot().await {
        Ok(published) => published,
        Err(_) => return,
    };
    let msg = snapshot_message(&published);

    let mut senders = Vec::with_capacity(lagging.len());
    for id in lagging {
        if let Some(sender) = registry.sender(id).await {
            senders.push((id, sender));
        }
    }
    debug!(clients = senders.len(), seq = published.seq, "Resyncing lagging clients");

    tokio::spawn(async move {
        join_all(senders.into_iter().map(|(id, sender)| {
            let frame = Outbound::Message(msg.clone());
            async move {
                if sender.send_timeout(frame, RESYNC_SEND_TIMEOUT).await.is_err() {
                    debug!(connection = id, "Resync not delivered");
                }
            }
        }))
        .await;
    });
}
