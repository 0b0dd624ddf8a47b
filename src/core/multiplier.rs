//! Fixed-Point Multiplier
//!
//! Multipliers are stored as integer hundredths so that crash points,
//! history entries, cashouts and payouts all compare exactly.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Multiplier(u32) - hundredths                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  1.00x  -> 100                                              │
//! │  1.73x  -> 173                                              │
//! │  2.00x  -> 200                                              │
//! │  Precision: 0.01x (the smallest visible step on the wire)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Floats only appear at the edges: the growth curve samples `e^(k·t)` and
//! floors the result into hundredths, and the wire renders hundredths as a
//! two-decimal number.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Hundredths per 1.00x.
pub const MULTIPLIER_SCALE: u32 = 100;

/// Multiplier in integer hundredths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(u32);

impl Multiplier {
    /// 1.00x, the floor of every multiplier.
    pub const ONE: Multiplier = Multiplier(MULTIPLIER_SCALE);

    /// Create from hundredths, clamped to at least 1.00x.
    pub const fn from_hundredths(hundredths: u32) -> Self {
        if hundredths < MULTIPLIER_SCALE {
            Self(MULTIPLIER_SCALE)
        } else {
            Self(hundredths)
        }
    }

    /// Floor a float multiplier into hundredths.
    ///
    /// Non-finite and sub-1.00 values collapse to 1.00x. A tiny epsilon
    /// absorbs representation error so `2.0` never floors to `1.99`.
    pub fn from_f64_floor(value: f64) -> Self {
        if !value.is_finite() || value <= 1.0 {
            return Self::ONE;
        }
        let scaled = (value * MULTIPLIER_SCALE as f64 + 1e-9).floor();
        if scaled >= u32::MAX as f64 {
            return Self(u32::MAX);
        }
        Self::from_hundredths(scaled as u32)
    }

    /// Raw hundredths.
    #[inline]
    pub const fn hundredths(self) -> u32 {
        self.0
    }

    /// Float value for display and the wire.
    #[inline]
    pub fn as_f64(self) -> f64 {
        self.0 as f64 / MULTIPLIER_SCALE as f64
    }

    /// Payout for a stake: floor(stake × multiplier).
    pub fn payout(self, stake: u64) -> u64 {
        let payout = (stake as u128 * self.0 as u128) / MULTIPLIER_SCALE as u128;
        payout.min(u64::MAX as u128) as u64
    }

    /// Net profit for a stake: payout − stake.
    pub fn profit(self, stake: u64) -> i64 {
        let payout = self.payout(stake) as i128;
        (payout - stake as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / MULTIPLIER_SCALE, self.0 % MULTIPLIER_SCALE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_clamps_to_one() {
        assert_eq!(Multiplier::from_hundredths(0), Multiplier::ONE);
        assert_eq!(Multiplier::from_f64_floor(0.5), Multiplier::ONE);
        assert_eq!(Multiplier::from_f64_floor(f64::NAN), Multiplier::ONE);
    }

    #[test]
    fn test_floor_keeps_exact_values() {
        assert_eq!(Multiplier::from_f64_floor(2.0).hundredths(), 200);
        assert_eq!(Multiplier::from_f64_floor(1.73).hundredths(), 173);
        assert_eq!(Multiplier::from_f64_floor(1.739).hundredths(), 173);
    }

    #[test]
    fn test_payout_floors() {
        let two = Multiplier::from_hundredths(200);
        assert_eq!(two.payout(100), 200);
        assert_eq!(two.profit(100), 100);

        let odd = Multiplier::from_hundredths(133);
        assert_eq!(odd.payout(10), 13);
        assert_eq!(odd.profit(10), 3);

        assert_eq!(Multiplier::ONE.profit(50), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Multiplier::from_hundredths(173).to_string(), "1.73x");
        assert_eq!(Multiplier::from_hundredths(1005).to_string(), "10.05x");
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&Multiplier::from_hundredths(250)).unwrap();
        assert_eq!(json, "250");
    }
}
