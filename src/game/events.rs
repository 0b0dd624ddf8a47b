//! Round Events
//!
//! Emitted by the state machine on every mutation. The driver fans them out
//! to clients and turns terminal ones into settlement jobs.

use std::time::Duration;

use crate::core::ids::{PlayerId, RoundId};
use crate::core::multiplier::Multiplier;
use crate::fairness::{RoundCommitment, RoundReveal};
use crate::game::ledger::Bet;

/// Something that happened to the current round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoundEvent {
    /// A fresh round is waiting for bets.
    RoundCreated {
        /// New round.
        round_id: RoundId,
        /// Commitment to its secret.
        commitment: RoundCommitment,
        /// Countdown length.
        starts_in: Duration,
    },

    /// The multiplier started growing.
    RoundStarted {
        /// Round that started.
        round_id: RoundId,
    },

    /// A bet was placed.
    PlayerJoined {
        /// Round joined.
        round_id: RoundId,
        /// The new bet.
        bet: Bet,
    },

    /// A bet was cashed out.
    PlayerCashedOut {
        /// Round of the bet.
        round_id: RoundId,
        /// Owner of the bet.
        player_id: PlayerId,
        /// Name shown to other players.
        display_name: String,
        /// Coins staked.
        stake: u64,
        /// Multiplier locked in.
        multiplier: Multiplier,
        /// floor(stake × multiplier).
        payout: u64,
        /// Triggered by the bet's auto-cashout target.
        automatic: bool,
    },

    /// The round crashed.
    RoundCrashed {
        /// Round that crashed.
        round_id: RoundId,
        /// Final multiplier.
        crash_point: Multiplier,
        /// Bets that never cashed out.
        losses: Vec<Bet>,
        /// Secret and crash point for verification.
        reveal: RoundReveal,
    },
}

impl RoundEvent {
    /// Round the event belongs to.
    pub fn round_id(&self) -> RoundId {
        match self {
            Self::RoundCreated { round_id, .. }
            | Self::RoundStarted { round_id }
            | Self::PlayerJoined { round_id, .. }
            | Self::PlayerCashedOut { round_id, .. }
            | Self::RoundCrashed { round_id, .. } => *round_id,
        }
    }

    /// Whether the event changes the round's phase.
    pub fn is_transition(&self) -> bool {
        matches!(
            self,
            Self::RoundCreated { .. } | Self::RoundStarted { .. } | Self::RoundCrashed { .. }
        )
    }

    /// Short name for logs and the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundCreated { .. } => "round_created",
            Self::RoundStarted { .. } => "round_started",
            Self::PlayerJoined { .. } => "player_joined",
            Self::PlayerCashedOut { .. } => "player_cashed_out",
            Self::RoundCrashed { .. } => "round_crashed",
        }
    }
}
