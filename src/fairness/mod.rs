//! Provably-fair crash points.
//!
//! Commit/reveal flow for each round:
//!
//! 1. Derive the round secret from the server master secret and round id
//! 2. Publish `SHA-256(domain ‖ round_secret)` while the round is waiting
//! 3. Derive the crash point from the round secret and round id
//! 4. Reveal the round secret after the crash so anyone can recompute it

pub mod secret;
pub mod crash_point;
pub mod commitment;

pub use secret::{ServerSecret, RoundSecret, SecretError};
pub use crash_point::{CrashPointConfig, generate_crash_point, generate_crash_point_with};
pub use commitment::{RoundCommitment, RoundReveal, CommitmentError};
