//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are serialized as JSON for debugging ease. Binary frames
//! carry a bincode-encoded [`BinaryClientMessage`], since bincode cannot
//! decode internally tagged enums.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::ids::RoundId;
use crate::core::multiplier::Multiplier;
use crate::fairness::RoundReveal;
use crate::game::events::RoundEvent;
use crate::game::ledger::{Bet, RejectionReason};
use crate::game::round::{PhaseKind, RoundSnapshot};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server.
    Auth(AuthRequest),

    /// Place a bet on the current round.
    Join(JoinRequest),

    /// Cash out the active bet.
    Cashout(CashoutRequest),

    /// Request a full snapshot of the current round.
    SyncRequest,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

/// Authentication request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// JWT issued by the auth provider.
    pub token: String,
    /// Client version, logged only.
    #[serde(default)]
    pub client_version: String,
}

/// Bet request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Coins to stake. Signed so that bad values reach validation.
    pub stake: i64,
    /// Round the client believes is current (UUID). Stale ids are rejected.
    #[serde(default)]
    pub round_id: Option<String>,
    /// Multiplier at which the server cashes out automatically.
    #[serde(default)]
    pub auto_cashout: Option<f64>,
}

/// Cashout request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CashoutRequest {
    /// Round the client believes is current (UUID).
    #[serde(default)]
    pub round_id: Option<String>,
}

/// A round id on the wire was not a UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("malformed round id")]
pub struct InvalidRoundId;

/// Parse an optional round id from the wire. `Ok(None)` when absent.
pub fn parse_round_id(raw: Option<&str>) -> Result<Option<RoundId>, InvalidRoundId> {
    match raw {
        None => Ok(None),
        Some(s) => RoundId::from_uuid_str(s).map(Some).ok_or(InvalidRoundId),
    }
}

/// Externally tagged mirror of [`ClientMessage`] for binary frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BinaryClientMessage {
    /// See [`ClientMessage::Auth`].
    Auth {
        /// JWT.
        token: String,
        /// Client version.
        client_version: String,
    },
    /// See [`ClientMessage::Join`].
    Join {
        /// Coins to stake.
        stake: i64,
        /// Raw round id.
        round_id: Option<[u8; 16]>,
        /// Auto-cashout target.
        auto_cashout: Option<f64>,
    },
    /// See [`ClientMessage::Cashout`].
    Cashout {
        /// Raw round id.
        round_id: Option<[u8; 16]>,
    },
    /// See [`ClientMessage::SyncRequest`].
    SyncRequest,
    /// See [`ClientMessage::Ping`].
    Ping {
        /// Client timestamp.
        timestamp: u64,
    },
}

impl From<BinaryClientMessage> for ClientMessage {
    fn from(msg: BinaryClientMessage) -> Self {
        let uuid = |raw: Option<[u8; 16]>| raw.map(|b| RoundId::new(b).to_uuid_string());
        match msg {
            BinaryClientMessage::Auth { token, client_version } => {
                ClientMessage::Auth(AuthRequest { token, client_version })
            }
            BinaryClientMessage::Join { stake, round_id, auto_cashout } => {
                ClientMessage::Join(JoinRequest { stake, round_id: uuid(round_id), auto_cashout })
            }
            BinaryClientMessage::Cashout { round_id } => {
                ClientMessage::Cashout(CashoutRequest { round_id: uuid(round_id) })
            }
            BinaryClientMessage::SyncRequest => ClientMessage::SyncRequest,
            BinaryClientMessage::Ping { timestamp } => ClientMessage::Ping { timestamp },
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Full round state.
    Snapshot(RoundStateUpdate),

    /// Something happened to the round.
    Event(RoundEventMessage),

    /// Bet accepted.
    JoinAccepted {
        /// Round joined.
        round_id: String,
        /// Coins staked.
        stake: u64,
        /// Registered auto-cashout target.
        auto_cashout: Option<f64>,
    },

    /// Cashout accepted.
    CashoutAccepted {
        /// Round of the bet.
        round_id: String,
        /// Multiplier locked in.
        multiplier: f64,
        /// Coins paid out.
        payout: u64,
    },

    /// Request refused. Only the requester receives it.
    Rejected {
        /// Which request was refused.
        request: RequestKind,
        /// Machine-readable reason.
        code: String,
        /// Human-readable reason.
        message: String,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (ms since epoch).
        server_time: u64,
    },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Reason for shutdown.
        reason: String,
    },
}

impl ServerMessage {
    /// Rejection for a refused request.
    pub fn rejected(request: RequestKind, reason: &RejectionReason) -> Self {
        ServerMessage::Rejected {
            request,
            code: reason.code().to_string(),
            message: reason.to_string(),
        }
    }

    /// Error with a code and message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }
}

/// Request kinds that can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// A join.
    Join,
    /// A cashout.
    Cashout,
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether authentication succeeded.
    pub success: bool,
    /// Player id (UUID) derived from the token.
    pub player_id: Option<String>,
    /// Name shown to other players.
    pub display_name: Option<String>,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// A bet as other players see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    /// Player id (UUID).
    pub player_id: String,
    /// Display name.
    pub username: String,
    /// Avatar URL.
    pub avatar_url: String,
    /// Coins staked.
    pub stake: u64,
    /// Cashout multiplier, if cashed out.
    pub cashout_multiplier: Option<f64>,
}

impl From<&Bet> for PlayerEntry {
    fn from(bet: &Bet) -> Self {
        Self {
            player_id: bet.player_id.to_uuid_string(),
            username: bet.display_name.clone(),
            avatar_url: bet.avatar_ref.clone(),
            stake: bet.stake,
            cashout_multiplier: bet.cashout.map(Multiplier::as_f64),
        }
    }
}

/// Reveal data for verifying a crashed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevealInfo {
    /// Round id (UUID).
    pub round_id: String,
    /// Round secret (hex).
    pub round_secret: String,
    /// Crash point.
    pub crash_multiplier: f64,
}

impl From<&RoundReveal> for RevealInfo {
    fn from(reveal: &RoundReveal) -> Self {
        Self {
            round_id: reveal.round_id.to_uuid_string(),
            round_secret: reveal.round_secret.to_hex(),
            crash_multiplier: reveal.crash_point.as_f64(),
        }
    }
}

/// Full round state as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStateUpdate {
    /// Monotonic sequence number across all snapshots.
    pub seq: u64,
    /// Round id (UUID).
    pub round_id: String,
    /// Phase tag.
    pub phase: PhaseKind,
    /// Current multiplier, two decimals.
    pub current_multiplier: f64,
    /// Whole seconds until start; waiting only.
    pub waiting_seconds_remaining: Option<u64>,
    /// Past crash points, newest first.
    pub history: Vec<f64>,
    /// Every bet in the round.
    pub players: Vec<PlayerEntry>,
    /// Commitment hash (hex).
    pub commitment: String,
    /// Reveal, once crashed.
    pub reveal: Option<RevealInfo>,
}

impl RoundStateUpdate {
    /// Build the wire form of a snapshot.
    pub fn from_snapshot(seq: u64, snapshot: &RoundSnapshot) -> Self {
        Self {
            seq,
            round_id: snapshot.round_id.to_uuid_string(),
            phase: snapshot.phase,
            current_multiplier: snapshot.current_multiplier.as_f64(),
            waiting_seconds_remaining: snapshot.waiting_seconds_remaining,
            history: snapshot.history.iter().map(|m| m.as_f64()).collect(),
            players: snapshot.players.iter().map(PlayerEntry::from).collect(),
            commitment: snapshot.commitment.to_hex(),
            reveal: snapshot.reveal.as_ref().map(RevealInfo::from),
        }
    }
}

/// Round events as sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoundEventMessage {
    /// A new round is waiting for bets.
    RoundCreated {
        /// Round id (UUID).
        round_id: String,
        /// Commitment hash (hex).
        commitment: String,
        /// Countdown length in milliseconds.
        starts_in_ms: u64,
    },
    /// The multiplier started growing.
    RoundStarted {
        /// Round id (UUID).
        round_id: String,
    },
    /// A bet was placed.
    PlayerJoined {
        /// Round id (UUID).
        round_id: String,
        /// The new bet.
        player: PlayerEntry,
    },
    /// A bet was cashed out.
    PlayerCashedOut {
        /// Round id (UUID).
        round_id: String,
        /// Player id (UUID).
        player_id: String,
        /// Display name.
        username: String,
        /// Multiplier locked in.
        multiplier: f64,
        /// Coins paid out.
        payout: u64,
        /// Triggered by the bet's auto-cashout target.
        automatic: bool,
    },
    /// The round crashed.
    RoundCrashed {
        /// Round id (UUID).
        round_id: String,
        /// Final multiplier.
        crash_multiplier: f64,
        /// Players whose bets were lost (UUIDs).
        losers: Vec<String>,
        /// Secret for verification.
        reveal: RevealInfo,
    },
}

impl From<&RoundEvent> for RoundEventMessage {
    fn from(event: &RoundEvent) -> Self {
        match event {
            RoundEvent::RoundCreated { round_id, commitment, starts_in } => Self::RoundCreated {
                round_id: round_id.to_uuid_string(),
                commitment: commitment.to_hex(),
                starts_in_ms: starts_in.as_millis() as u64,
            },
            RoundEvent::RoundStarted { round_id } => Self::RoundStarted {
                round_id: round_id.to_uuid_string(),
            },
            RoundEvent::PlayerJoined { round_id, bet } => Self::PlayerJoined {
                round_id: round_id.to_uuid_string(),
                player: PlayerEntry::from(bet),
            },
            RoundEvent::PlayerCashedOut {
                round_id,
                player_id,
                display_name,
                multiplier,
                payout,
                automatic,
                ..
            } => Self::PlayerCashedOut {
                round_id: round_id.to_uuid_string(),
                player_id: player_id.to_uuid_string(),
                username: display_name.clone(),
                multiplier: multiplier.as_f64(),
                payout: *payout,
                automatic: *automatic,
            },
            RoundEvent::RoundCrashed { round_id, crash_point, losses, reveal } => Self::RoundCrashed {
                round_id: round_id.to_uuid_string(),
                crash_multiplier: crash_point.as_f64(),
                losers: losses.iter().map(|b| b.player_id.to_uuid_string()).collect(),
                reveal: RevealInfo::from(reveal),
            },
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Server error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Invalid input.
    InvalidInput,
    /// Balance could not be checked.
    LedgerUnavailable,
    /// The round driver is not running.
    RoundUnavailable,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Deserialize a binary frame.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize::<BinaryClientMessage>(data).map(Into::into)
    }
}

impl BinaryClientMessage {
    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
