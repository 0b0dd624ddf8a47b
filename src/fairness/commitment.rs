//! Round Commitment Protocol
//!
//! Commit to the round secret before any bet is accepted.
//! Reveal and verify once the round has crashed.

use serde::{Serialize, Deserialize};

use crate::core::hash::{Digest32, DomainHasher};
use crate::core::ids::RoundId;
use crate::core::multiplier::Multiplier;
use crate::fairness::crash_point::{CrashPointConfig, generate_crash_point_with};
use crate::fairness::secret::RoundSecret;

/// Published before the round runs.
///
/// Binds the server to a round secret, and so to a crash point, before any
/// player can join.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCommitment {
    /// Round this commitment belongs to.
    pub round_id: RoundId,

    /// SHA-256(domain ‖ round_secret).
    pub commitment_hash: Digest32,
}

impl RoundCommitment {
    /// Commit to a round secret.
    pub fn from_secret(round_id: RoundId, secret: &RoundSecret) -> Self {
        Self {
            round_id,
            commitment_hash: compute_commitment_hash(secret),
        }
    }

    /// Check a secret against this commitment.
    pub fn verify(&self, secret: &RoundSecret) -> bool {
        compute_commitment_hash(secret) == self.commitment_hash
    }

    /// Hex form for the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.commitment_hash)
    }
}

fn compute_commitment_hash(secret: &RoundSecret) -> Digest32 {
    let mut hasher = DomainHasher::for_commitment();
    hasher.update_bytes(secret.as_bytes());
    hasher.finalize()
}

/// Published once the round has crashed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundReveal {
    /// Round being revealed.
    pub round_id: RoundId,

    /// The committed secret.
    pub round_secret: RoundSecret,

    /// Crash point the round actually used.
    pub crash_point: Multiplier,
}

impl RoundReveal {
    /// Create a new reveal.
    pub fn new(round_id: RoundId, round_secret: RoundSecret, crash_point: Multiplier) -> Self {
        Self {
            round_id,
            round_secret,
            crash_point,
        }
    }

    /// Verify the reveal against the published commitment.
    pub fn verify(
        &self,
        commitment: &RoundCommitment,
        config: &CrashPointConfig,
    ) -> Result<(), CommitmentError> {
        // 1. Same round
        if commitment.round_id != self.round_id {
            return Err(CommitmentError::RoundIdMismatch);
        }

        // 2. Secret matches commitment
        if !commitment.verify(&self.round_secret) {
            return Err(CommitmentError::PreimageMismatch);
        }

        // 3. Crash point recomputes
        let expected = generate_crash_point_with(&self.round_secret, &self.round_id, config);
        if expected != self.crash_point {
            return Err(CommitmentError::CrashPointMismatch {
                expected,
                got: self.crash_point,
            });
        }

        Ok(())
    }
}

/// Errors that can occur during reveal verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitmentError {
    /// Reveal names a different round.
    RoundIdMismatch,

    /// Secret hash doesn't match commitment.
    PreimageMismatch,

    /// Claimed crash point is not what the secret produces.
    CrashPointMismatch {
        /// Recomputed from the secret.
        expected: Multiplier,
        /// Claimed by the reveal.
        got: Multiplier,
    },
}

impl std::fmt::Display for CommitmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundIdMismatch => write!(f, "Round ID mismatch"),
            Self::PreimageMismatch => write!(f, "Round secret doesn't match commitment"),
            Self::CrashPointMismatch { expected, got } => {
                write!(f, "Crash point mismatch: expected {}, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for CommitmentError {}
