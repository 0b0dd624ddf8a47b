//! Per-Round Bet Ledger
//!
//! Tracks who joined the current round, their stake, and their cashout.
//! Enforces one bet per player and one cashout per bet. Phase gating is the
//! state machine's job; the ledger only sees requests that already passed it.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::ids::PlayerId;
use crate::core::multiplier::Multiplier;

/// Generated avatar used when a profile has none.
pub const DEFAULT_AVATAR_BASE: &str = "https://api.dicebear.com/7.x/avataaars/svg?seed=";

/// Lowest auto-cashout target accepted at join.
pub const MIN_AUTO_CASHOUT: Multiplier = Multiplier::from_hundredths(101);

// =============================================================================
// REJECTIONS
// =============================================================================

/// Why a join or cashout was refused. Sent only to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    /// The round is not in a phase that accepts this request, or the request
    /// names a round that is no longer current.
    #[error("round is not accepting this request")]
    InvalidPhase,

    /// The player already has a bet in this round.
    #[error("player already has a bet in this round")]
    DuplicateBet,

    /// Stake is non-positive, out of range or unaffordable.
    #[error("invalid stake {stake}: {detail}")]
    InvalidStake {
        /// Stake as requested.
        stake: i64,
        /// What was wrong with it.
        detail: String,
    },

    /// The player has no bet in this round.
    #[error("player has no bet in this round")]
    UnknownBet,

    /// The bet was already cashed out.
    #[error("bet already cashed out")]
    AlreadyCashedOut,

    /// Auto-cashout target out of range, or already passed at join time.
    #[error("invalid auto-cashout {target}: {detail}")]
    InvalidAutoCashout {
        /// Target as requested, floored to hundredths.
        target: Multiplier,
        /// What was wrong with it.
        detail: String,
    },
}

impl RejectionReason {
    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPhase => "invalid_phase",
            Self::DuplicateBet => "duplicate_bet",
            Self::InvalidStake { .. } => "invalid_stake",
            Self::UnknownBet => "unknown_bet",
            Self::AlreadyCashedOut => "already_cashed_out",
            Self::InvalidAutoCashout { .. } => "invalid_auto_cashout",
        }
    }

    /// Shorthand for an [`RejectionReason::InvalidStake`].
    pub fn invalid_stake(stake: i64, detail: impl Into<String>) -> Self {
        Self::InvalidStake { stake, detail: detail.into() }
    }

    /// Shorthand for an [`RejectionReason::InvalidAutoCashout`].
    pub fn invalid_auto_cashout(target: Multiplier, detail: impl Into<String>) -> Self {
        Self::InvalidAutoCashout { target, detail: detail.into() }
    }
}

// =============================================================================
// PLAYER PROFILE
// =============================================================================

/// Display context attached to a bet, taken from the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    /// Player identity.
    pub player_id: PlayerId,
    /// Name shown to other players.
    pub display_name: String,
    /// Avatar URL.
    pub avatar_ref: String,
}

impl PlayerProfile {
    /// Build a profile, generating an avatar from the name when none is given.
    pub fn new(player_id: PlayerId, display_name: impl Into<String>, avatar_ref: Option<String>) -> Self {
        let display_name = display_name.into();
        let avatar_ref = avatar_ref
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| default_avatar(&display_name));
        Self { player_id, display_name, avatar_ref }
    }
}

/// Generated avatar URL for a display name.
pub fn default_avatar(display_name: &str) -> String {
    format!("{}{}", DEFAULT_AVATAR_BASE, display_name)
}

// =============================================================================
// BET
// =============================================================================

/// One player's stake in one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bet {
    /// Player identity.
    pub player_id: PlayerId,
    /// Name shown to other players.
    pub display_name: String,
    /// Avatar URL.
    pub avatar_ref: String,
    /// Coins staked at join time.
    pub stake: u64,
    /// Set once, on cashout.
    pub cashout: Option<Multiplier>,
    /// Target at which the server cashes out on the player's behalf.
    #[serde(default)]
    pub auto_cashout: Option<Multiplier>,
}

impl Bet {
    /// Still riding the multiplier.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.cashout.is_none()
    }

    /// Payout if cashed out, `None` otherwise.
    pub fn payout(&self) -> Option<u64> {
        self.cashout.map(|m| m.payout(self.stake))
    }
}

// =============================================================================
// LEDGER
// =============================================================================

/// Bets for a single round, keyed by player.
#[derive(Debug, Clone, Default)]
pub struct BetLedger {
    bets: BTreeMap<PlayerId, Bet>,
}

impl BetLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a bet. One per player.
    pub fn join(
        &mut self,
        profile: PlayerProfile,
        stake: u64,
        auto_cashout: Option<Multiplier>,
    ) -> Result<&Bet, RejectionReason> {
        if stake == 0 {
            return Err(RejectionReason::invalid_stake(0, "stake must be positive"));
        }
        if self.bets.contains_key(&profile.player_id) {
            return Err(RejectionReason::DuplicateBet);
        }

        let player_id = profile.player_id;
        let bet = Bet {
            player_id,
            display_name: profile.display_name,
            avatar_ref: profile.avatar_ref,
            stake,
            cashout: None,
            auto_cashout,
        };
        Ok(&*self.bets.entry(player_id).or_insert(bet))
    }

    /// Record a cashout. Once set it never changes.
    pub fn cashout(&mut self, player_id: &PlayerId, multiplier: Multiplier) -> Result<&Bet, RejectionReason> {
        let bet = self.bets.get_mut(player_id).ok_or(RejectionReason::UnknownBet)?;
        if bet.cashout.is_some() {
            return Err(RejectionReason::AlreadyCashedOut);
        }
        bet.cashout = Some(multiplier);
        Ok(&*bet)
    }

    /// Look up a player's bet.
    pub fn get(&self, player_id: &PlayerId) -> Option<&Bet> {
        self.bets.get(player_id)
    }

    /// Bets still riding ("current players").
    pub fn active(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values().filter(|b| b.is_active())
    }

    /// All bets, in player id order.
    pub fn bets(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values()
    }

    /// Number of bets.
    pub fn len(&self) -> usize {
        self.bets.len()
    }

    /// No bets placed.
    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    /// Total coins staked.
    pub fn total_staked(&self) -> u64 {
        self.bets.values().fold(0u64, |acc, b| acc.saturating_add(b.stake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(n: u8) -> PlayerProfile {
        PlayerProfile::new(PlayerId::new([n; 16]), format!("player{}", n), None)
    }

    #[test]
    fn test_join_and_duplicate() {
        let mut ledger = BetLedger::new();
        assert_eq!(ledger.join(profile(1), 100, None).unwrap().stake, 100);
        assert_eq!(ledger.join(profile(1), 50, None), Err(RejectionReason::DuplicateBet));
        assert_eq!(ledger.get(&PlayerId::new([1; 16])).unwrap().stake, 100);
    }

    #[test]
    fn test_zero_stake_rejected() {
        let mut ledger = BetLedger::new();
        assert!(matches!(ledger.join(profile(1), 0, None), Err(RejectionReason::InvalidStake { .. })));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_cashout_once() {
        let mut ledger = BetLedger::new();
        ledger.join(profile(1), 100, None).unwrap();
        let id = PlayerId::new([1; 16]);
        let two = Multiplier::from_hundredths(200);

        let bet = ledger.cashout(&id, two).unwrap();
        assert_eq!(bet.payout(), Some(200));

        let three = Multiplier::from_hundredths(300);
        assert_eq!(ledger.cashout(&id, three), Err(RejectionReason::AlreadyCashedOut));
        assert_eq!(ledger.get(&id).unwrap().cashout, Some(two));
    }

    #[test]
    fn test_auto_cashout_target_kept() {
        let mut ledger = BetLedger::new();
        let target = Multiplier::from_hundredths(250);
        let bet = ledger.join(profile(1), 100, Some(target)).unwrap();
        assert_eq!(bet.auto_cashout, Some(target));
        assert!(bet.is_active());

        let reason = RejectionReason::invalid_auto_cashout(Multiplier::ONE, "minimum is 1.01x");
        assert_eq!(reason.code(), "invalid_auto_cashout");
        assert_eq!(reason.to_string(), "invalid auto-cashout 1.00x: minimum is 1.01x");
    }

    #[test]
    fn test_cashout_unknown_bet() {
        let mut ledger = BetLedger::new();
        assert_eq!(
            ledger.cashout(&PlayerId::new([9; 16]), Multiplier::ONE),
            Err(RejectionReason::UnknownBet)
        );
    }

    #[test]
    fn test_active_view() {
        let mut ledger = BetLedger::new();
        ledger.join(profile(1), 10, None).unwrap();
        ledger.join(profile(2), 20, None).unwrap();
        ledger.cashout(&PlayerId::new([1; 16]), Multiplier::from_hundredths(150)).unwrap();

        let active: Vec<_> = ledger.active().map(|b| b.player_id).collect();
        assert_eq!(active, vec![PlayerId::new([2; 16])]);
        assert_eq!(ledger.bets().count(), 2);
        assert_eq!(ledger.total_staked(), 30);
    }

    #[test]
    fn test_avatar_fallback() {
        let p = PlayerProfile::new(PlayerId::new([1; 16]), "alice", None);
        assert_eq!(p.avatar_ref, "https://api.dicebear.com/7.x/avataaars/svg?seed=alice");

        let p = PlayerProfile::new(PlayerId::new([1; 16]), "alice", Some("  ".into()));
        assert!(p.avatar_ref.ends_with("seed=alice"));

        let p = PlayerProfile::new(PlayerId::new([1; 16]), "alice", Some("https://x/a.png".into()));
        assert_eq!(p.avatar_ref, "https://x/a.png");
    }

    #[test]
    fn test_rejection_codes() {
        assert_eq!(RejectionReason::DuplicateBet.code(), "duplicate_bet");
        assert_eq!(RejectionReason::invalid_stake(-1, "x").code(), "invalid_stake");
    }
}
