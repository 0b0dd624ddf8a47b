//! Domain-Separated Hashing
//!
//! SHA-256 helpers used by the fairness module:
//! - Round secret derivation from the server master secret
//! - Commitments published before a round runs
//! - Crash point derivation
//!
//! Every hash starts with a domain tag so outputs from one purpose can never
//! be replayed as another.

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type Digest32 = [u8; 32];

/// Domain tag for per-round secret derivation.
pub const ROUND_SECRET_DOMAIN: &[u8] = b"CRASH_ROUND_SECRET_V1";

/// Domain tag for round commitments.
pub const COMMITMENT_DOMAIN: &[u8] = b"CRASH_COMMIT_V1";

/// Domain tag for crash point derivation.
pub const CRASH_POINT_DOMAIN: &[u8] = b"CRASH_POINT_V1";

/// Deterministic hasher with a domain separator.
///
/// Order of updates is part of the output; callers must feed fields in a
/// fixed order.
pub struct DomainHasher {
    hasher: Sha256,
}

impl DomainHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for round secret derivation.
    pub fn for_round_secret() -> Self {
        Self::new(ROUND_SECRET_DOMAIN)
    }

    /// Create hasher for commitments.
    pub fn for_commitment() -> Self {
        Self::new(COMMITMENT_DOMAIN)
    }

    /// Create hasher for crash points.
    pub fn for_crash_point() -> Self {
        Self::new(CRASH_POINT_DOMAIN)
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a u64 value (little-endian).
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &[u8; 16]) {
        self.hasher.update(uuid);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Digest32 {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Digest32 {
    let mut hasher = DomainHasher::new(domain);
    hasher.update_bytes(data);
    hasher.finalize()
}

/// Read the first 8 bytes of a digest as a big-endian u64.
pub fn leading_u64(digest: &Digest32) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Decode a 32-byte value from hex.
pub fn digest_from_hex(s: &str) -> Option<Digest32> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}
