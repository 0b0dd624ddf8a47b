//! Crash Point Derivation
//!
//! Maps `SHA-256(domain ‖ round_secret ‖ round_id)` to a multiplier:
//!
//! ```text
//! r      = top 52 bits of the digest / 2^52          (uniform in [0, 1))
//! crash  = (1 - edge) / (1 - r)                       (heavy mass near 1.00x)
//! result = clamp(floor(crash, 0.01), 1.00, max)
//! ```
//!
//! With a 1% edge, `P(crash >= m) = 0.99 / m`, so the expected payout of any
//! fixed cashout target is 99% of the stake. Everything after hashing is
//! integer arithmetic, so any client can reproduce the value exactly.

use serde::{Serialize, Deserialize};

use crate::core::hash::{DomainHasher, leading_u64};
use crate::core::ids::RoundId;
use crate::core::multiplier::Multiplier;
use crate::fairness::secret::RoundSecret;

/// Bits of uniform randomness taken from the digest.
const UNIFORM_BITS: u32 = 52;

/// Basis points in 100%.
const BPS_SCALE: u128 = 10_000;

/// Distribution parameters. Part of what a verifier must know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashPointConfig {
    /// House edge in basis points (100 = 1%).
    pub house_edge_bps: u32,
    /// Highest crash point the round can reach.
    pub max_multiplier: Multiplier,
}

impl Default for CrashPointConfig {
    fn default() -> Self {
        Self {
            house_edge_bps: 100,
            max_multiplier: Multiplier::from_hundredths(100_00),
        }
    }
}

/// Crash point with the default distribution.
pub fn generate_crash_point(secret: &RoundSecret, round_id: &RoundId) -> Multiplier {
    generate_crash_point_with(secret, round_id, &CrashPointConfig::default())
}

/// Crash point with an explicit distribution.
pub fn generate_crash_point_with(
    secret: &RoundSecret,
    round_id: &RoundId,
    config: &CrashPointConfig,
) -> Multiplier {
    let mut hasher = DomainHasher::for_crash_point();
    hasher.update_bytes(secret.as_bytes());
    hasher.update_uuid(round_id.as_bytes());
    let digest = hasher.finalize();

    let uniform = leading_u64(&digest) >> (64 - UNIFORM_BITS);
    crash_from_uniform(uniform, config)
}

/// Map 52 uniform bits to a crash point.
fn crash_from_uniform(uniform: u64, config: &CrashPointConfig) -> Multiplier {
    let span: u128 = 1u128 << UNIFORM_BITS;
    let edge = (config.house_edge_bps as u128).min(BPS_SCALE);

    // hundredths = (1 - edge) * 100 / (1 - r) = (BPS - edge) * span / ((span - u) * BPS / 100)
    let numerator = (BPS_SCALE - edge) * span;
    let denominator = (span - uniform as u128) * (BPS_SCALE / 100);
    let hundredths = numerator / denominator;

    let capped = hundredths.min(config.max_multiplier.hundredths() as u128) as u32;
    Multiplier::from_hundredths(capped)
}
