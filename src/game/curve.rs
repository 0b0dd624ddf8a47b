//! Multiplier Growth Curve
//!
//! `m(t) = 1 + (e^(k·t) − 1) / d`, floored to hundredths.
//!
//! With the defaults (k = 0.25, d = 4) the multiplier reaches 2.00x after
//! ~6.4s and 10.00x after ~14.3s.

use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::core::multiplier::Multiplier;

/// Growth curve parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrowthCurve {
    /// Exponential rate per second.
    pub k: f64,
    /// Divisor applied to the exponential term.
    pub d: f64,
}

impl Default for GrowthCurve {
    fn default() -> Self {
        Self { k: 0.25, d: 4.0 }
    }
}

impl GrowthCurve {
    /// Create a curve, falling back to the defaults for non-positive parameters.
    pub fn new(k: f64, d: f64) -> Self {
        let fallback = Self::default();
        Self {
            k: if k.is_finite() && k > 0.0 { k } else { fallback.k },
            d: if d.is_finite() && d > 0.0 { d } else { fallback.d },
        }
    }

    /// Multiplier after `elapsed` of running time.
    pub fn multiplier_at(&self, elapsed: Duration) -> Multiplier {
        let t = elapsed.as_secs_f64();
        let raw = 1.0 + ((self.k * t).exp() - 1.0) / self.d;
        Multiplier::from_f64_floor(raw)
    }

    /// Running time at which the curve reaches `target`.
    ///
    /// Inverse of [`Self::multiplier_at`]: `t = ln(1 + (m − 1)·d) / k`,
    /// rounded up to the next nanosecond so sampling at the result never
    /// floors below `target`.
    pub fn time_to_reach(&self, target: Multiplier) -> Duration {
        let m = target.as_f64();
        let t = (1.0 + (m - 1.0) * self.d).ln() / self.k;
        if t.is_finite() && t > 0.0 {
            Duration::from_secs_f64(t) + Duration::from_nanos(1)
        } else {
            Duration::ZERO
        }
    }
}
