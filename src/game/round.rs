//! Round State Definitions
//!
//! The round, its phase, crash history and the snapshot handed to the
//! broadcast layer.

use std::collections::VecDeque;
use serde::{Serialize, Deserialize};
use tokio::time::Instant;

use crate::core::ids::RoundId;
use crate::core::multiplier::Multiplier;
use crate::fairness::{RoundCommitment, RoundReveal, RoundSecret};
use crate::game::ledger::{Bet, BetLedger};

// =============================================================================
// PHASE
// =============================================================================

/// Round phase, each variant carrying its own timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundPhase {
    /// Counting down; joins accepted.
    Waiting {
        /// When the round was created.
        created_at: Instant,
        /// When it will start running.
        starts_at: Instant,
    },
    /// Multiplier growing; cashouts accepted.
    Running {
        /// The scheduled start instant.
        started_at: Instant,
        /// Analytic instant the curve reaches the crash point.
        crash_at: Instant,
    },
    /// Terminated; cool-down before the next round.
    Crashed {
        /// When the round started running.
        started_at: Instant,
        /// When it crashed.
        crashed_at: Instant,
        /// When the next round will be created.
        next_round_at: Instant,
    },
}

impl RoundPhase {
    /// Variant tag without timestamps.
    pub fn kind(&self) -> PhaseKind {
        match self {
            Self::Waiting { .. } => PhaseKind::Waiting,
            Self::Running { .. } => PhaseKind::Running,
            Self::Crashed { .. } => PhaseKind::Crashed,
        }
    }

    /// The next instant at which this phase ends.
    pub fn deadline(&self) -> Instant {
        match *self {
            Self::Waiting { starts_at, .. } => starts_at,
            Self::Running { crash_at, .. } => crash_at,
            Self::Crashed { next_round_at, .. } => next_round_at,
        }
    }
}

/// Phase tag as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Countdown.
    Waiting,
    /// Multiplier growing.
    Running,
    /// Round over.
    Crashed,
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// The unit of play.
///
/// The crash point and round secret are private; they leave this type only
/// through [`Round::reveal`], which returns `None` until the round crashed.
#[derive(Debug, Clone)]
pub struct Round {
    id: RoundId,
    created_at: Instant,
    phase: RoundPhase,
    crash_point: Multiplier,
    secret: RoundSecret,
    commitment: RoundCommitment,
    ledger: BetLedger,
}

impl Round {
    pub(crate) fn new(
        id: RoundId,
        secret: RoundSecret,
        crash_point: Multiplier,
        phase: RoundPhase,
    ) -> Self {
        let commitment = RoundCommitment::from_secret(id, &secret);
        let created_at = match phase {
            RoundPhase::Waiting { created_at, .. } => created_at,
            RoundPhase::Running { started_at, .. } | RoundPhase::Crashed { started_at, .. } => started_at,
        };
        Self {
            id,
            created_at,
            phase,
            crash_point,
            secret,
            commitment,
            ledger: BetLedger::new(),
        }
    }

    /// Round identifier.
    pub fn id(&self) -> RoundId {
        self.id
    }

    /// When the round began accepting bets.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Current phase.
    pub fn phase(&self) -> &RoundPhase {
        &self.phase
    }

    /// Published commitment.
    pub fn commitment(&self) -> &RoundCommitment {
        &self.commitment
    }

    /// Bets placed in this round.
    pub fn ledger(&self) -> &BetLedger {
        &self.ledger
    }

    /// Crash point, once crashed.
    pub fn revealed_crash_point(&self) -> Option<Multiplier> {
        match self.phase {
            RoundPhase::Crashed { .. } => Some(self.crash_point),
            _ => None,
        }
    }

    /// Reveal, once crashed.
    pub fn reveal(&self) -> Option<RoundReveal> {
        match self.phase {
            RoundPhase::Crashed { .. } => Some(RoundReveal::new(
                self.id,
                self.secret.clone(),
                self.crash_point,
            )),
            _ => None,
        }
    }

    pub(crate) fn crash_point(&self) -> Multiplier {
        self.crash_point
    }

    pub(crate) fn set_phase(&mut self, phase: RoundPhase) {
        self.phase = phase;
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut BetLedger {
        &mut self.ledger
    }
}

// =============================================================================
// HISTORY
// =============================================================================

/// Final multipliers of past rounds, newest first.
#[derive(Debug, Clone)]
pub struct CrashHistory {
    entries: VecDeque<Multiplier>,
    capacity: usize,
}

/// Default number of past rounds kept.
pub const DEFAULT_HISTORY_LEN: usize = 8;

impl Default for CrashHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl CrashHistory {
    /// Empty history holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a crash point as the newest entry.
    pub fn push(&mut self, crash_point: Multiplier) {
        self.entries.push_front(crash_point);
        self.entries.truncate(self.capacity);
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Multiplier> {
        self.entries.iter()
    }

    /// Owned copy, newest first.
    pub fn to_vec(&self) -> Vec<Multiplier> {
        self.entries.iter().copied().collect()
    }

    /// Entries held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No rounds recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Full round state at one instant, safe to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSnapshot {
    /// Round identifier.
    pub round_id: RoundId,
    /// Phase tag.
    pub phase: PhaseKind,
    /// 1.00x while waiting, live while running, crash point once crashed.
    pub current_multiplier: Multiplier,
    /// Whole seconds (rounded up) until the round starts; waiting only.
    pub waiting_seconds_remaining: Option<u64>,
    /// Past crash points, newest first.
    pub history: Vec<Multiplier>,
    /// Every bet in the round.
    pub players: Vec<Bet>,
    /// Commitment to the round secret.
    pub commitment: RoundCommitment,
    /// Present once crashed.
    pub reveal: Option<RoundReveal>,
}
