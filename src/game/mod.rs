//! Round Logic Module
//!
//! Everything that decides what happens in a round. No I/O, no clocks of its
//! own: callers pass the instant each operation applies to.
//!
//! ## Module Structure
//!
//! - `curve`: Multiplier growth as a function of running time
//! - `ledger`: Per-round bets and rejection reasons
//! - `round`: Round, phase, history and snapshot types
//! - `machine`: The WAITING → RUNNING → CRASHED state machine
//! - `events`: Events emitted on every mutation

pub mod curve;
pub mod ledger;
pub mod round;
pub mod machine;
pub mod events;

// Re-export key types
pub use curve::GrowthCurve;
pub use ledger::{Bet, BetLedger, PlayerProfile, RejectionReason};
pub use round::{CrashHistory, PhaseKind, Round, RoundPhase, RoundSnapshot};
pub use machine::{RoundConfig, RoundMachine};
pub use events::RoundEvent;
