//! Core primitives.
//!
//! Identifiers, fixed-point multipliers and domain-separated hashing shared
//! by the fairness module, the state machine and the network layer.

pub mod ids;
pub mod multiplier;
pub mod hash;

// Re-export core types
pub use ids::{PlayerId, RoundId};
pub use multiplier::{Multiplier, MULTIPLIER_SCALE};
pub use hash::{Digest32, DomainHasher};
