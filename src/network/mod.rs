//! Network Layer
//!
//! WebSocket server for real-time Crash clients.
//! This layer owns the clock; all round logic runs through `game/`.

pub mod auth;
pub mod protocol;
pub mod driver;
pub mod session;
pub mod gateway;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, validate_token};
pub use protocol::{ClientMessage, ServerMessage, RoundStateUpdate, RoundEventMessage};
pub use driver::{DriverConfig, RoundDriver, RoundHandle, RoundBroadcast, RoundRequestError};
pub use session::{ClientRegistry, ConnectionId, Outbound};
pub use gateway::{BroadcastGateway, GatewayError};
pub use server::{GameServer, ServerConfig, GameServerError};
