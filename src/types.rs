// =============================================================================
// Shared types used across the regime & risk core
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{RegimeError, Result};

/// A return expressed as a fraction of position value (0.05 == +5 %).
///
/// Callers that think in percentages must go through [`Fraction::from_percent`]
/// so the Kelly and volatility statistics never mix units.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Fraction(f64);

impl Fraction {
    /// Wrap a fractional return. Rejects non-finite values and losses of
    /// 100 % or more.
    pub fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || value <= -1.0 {
            return Err(RegimeError::InvalidFraction(value));
        }
        Ok(Self(value))
    }

    /// Convert a percentage (5.0 == +5 %) into a fraction.
    pub fn from_percent(percent: f64) -> Result<Self> {
        Self::new(percent / 100.0)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_win(self) -> bool {
        self.0 > 0.0
    }
}

impl TryFrom<f64> for Fraction {
    type Error = RegimeError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Fraction> for f64 {
    fn from(f: Fraction) -> Self {
        f.0
    }
}

impl std::fmt::Display for Fraction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}%", self.0 * 100.0)
    }
}

/// A completed trade as reported by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub pnl: Fraction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub symbol: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_and_fraction_agree() {
        let a = Fraction::new(0.05).unwrap();
        let b = Fraction::from_percent(5.0).unwrap();
        assert!((a.value() - b.value()).abs() < 1e-12);
    }

    #[test]
    fn rejects_total_loss_and_nan() {
        assert!(Fraction::new(-1.0).is_err());
        assert!(Fraction::new(f64::NAN).is_err());
        assert!(Fraction::new(f64::INFINITY).is_err());
        assert!(Fraction::new(-0.99).is_ok());
    }

    #[test]
    fn deserialise_validates() {
        let ok: Fraction = serde_json::from_str("0.02").unwrap();
        assert!((ok.value() - 0.02).abs() < f64::EPSILON);
        assert!(serde_json::from_str::<Fraction>("-3.0").is_err());
    }

    #[test]
    fn display_as_percent() {
        assert_eq!(format!("{}", Fraction::new(0.0125).unwrap()), "1.25%");
    }
}
