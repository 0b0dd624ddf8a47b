//! Server and Round Secrets
//!
//! The server holds one master secret for its lifetime. Each round gets its
//! own secret derived from the master and the round id; only the round
//! secret is ever revealed, so a reveal says nothing about other rounds.

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use crate::core::hash::{Digest32, DomainHasher, digest_from_hex};
use crate::core::ids::RoundId;

/// Errors parsing a secret.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// Not valid hex or not 32 bytes.
    #[error("secret must be 64 hex characters")]
    InvalidHex,
    /// All-zero secrets are rejected.
    #[error("secret must not be all zeros")]
    Degenerate,
}

/// Per-server master secret. Never serialized, never logged.
#[derive(Clone)]
pub struct ServerSecret([u8; 32]);

impl ServerSecret {
    /// Wrap raw bytes.
    pub fn new(bytes: [u8; 32]) -> Result<Self, SecretError> {
        if bytes.iter().all(|&b| b == 0) {
            return Err(SecretError::Degenerate);
        }
        Ok(Self(bytes))
    }

    /// Generate a fresh secret from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        loop {
            OsRng.fill_bytes(&mut bytes);
            if bytes.iter().any(|&b| b != 0) {
                return Self(bytes);
            }
        }
    }

    /// Parse from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, SecretError> {
        let bytes = digest_from_hex(s.trim()).ok_or(SecretError::InvalidHex)?;
        Self::new(bytes)
    }

    /// Derive the secret for one round.
    pub fn derive_round_secret(&self, round_id: &RoundId) -> RoundSecret {
        let mut hasher = DomainHasher::for_round_secret();
        hasher.update_bytes(&self.0);
        hasher.update_uuid(round_id.as_bytes());
        RoundSecret(hasher.finalize())
    }
}

impl std::fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSecret(<redacted>)")
    }
}

/// Secret for a single round. Revealed once the round has crashed.
#[derive(Clone, PartialEq, Eq)]
pub struct RoundSecret(Digest32);

impl RoundSecret {
    /// Wrap raw bytes (used when verifying a published reveal).
    pub const fn from_bytes(bytes: Digest32) -> Self {
        Self(bytes)
    }

    /// Parse from hex as published in a reveal.
    pub fn from_hex(s: &str) -> Result<Self, SecretError> {
        digest_from_hex(s.trim())
            .map(Self)
            .ok_or(SecretError::InvalidHex)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &Digest32 {
        &self.0
    }

    /// Hex encoding for the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Keeps an unrevealed secret out of `{:?}` log lines.
impl std::fmt::Debug for RoundSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoundSecret(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_secret_derivation_is_deterministic() {
        let master = ServerSecret::new([9; 32]).unwrap();
        let round = RoundId::new([1; 16]);
        assert_eq!(master.derive_round_secret(&round), master.derive_round_secret(&round));
    }

    #[test]
    fn test_round_secrets_differ_per_round_and_master() {
        let master = ServerSecret::new([9; 32]).unwrap();
        let other = ServerSecret::new([8; 32]).unwrap();
        let a = RoundId::new([1; 16]);
        let b = RoundId::new([2; 16]);

        assert_ne!(master.derive_round_secret(&a), master.derive_round_secret(&b));
        assert_ne!(master.derive_round_secret(&a), other.derive_round_secret(&a));
    }

    #[test]
    fn test_zero_secret_rejected() {
        assert_eq!(ServerSecret::new([0; 32]).unwrap_err(), SecretError::Degenerate);
    }

    #[test]
    fn test_from_hex() {
        let hex_secret = "11".repeat(32);
        assert!(ServerSecret::from_hex(&hex_secret).is_ok());
        assert_eq!(ServerSecret::from_hex("1234").unwrap_err(), SecretError::InvalidHex);
    }

    #[test]
    fn test_debug_is_redacted() {
        let master = ServerSecret::new([0xAA; 32]).unwrap();
        let round = master.derive_round_secret(&RoundId::new([1; 16]));
        assert!(!format!("{:?}", master).contains("aa"));
        assert!(!format!("{:?}", round).contains(&round.to_hex()));
    }

    #[test]
    fn test_round_secret_hex_roundtrip() {
        let master = ServerSecret::generate();
        let secret = master.derive_round_secret(&RoundId::generate());
        assert_eq!(RoundSecret::from_hex(&secret.to_hex()).unwrap(), secret);
    }
}
