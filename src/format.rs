//! Precision-preserving numeric string formatter.
//!
//! The sole place where a price or size is turned into a string for display.
//! Deterministic and pure: same inputs always produce the same output, and
//! it never touches the network or a clock.

use rust_decimal::prelude::*;
use rust_decimal::RoundingStrategy;

/// Maximum fractional digits kept by `format`. Truncation, never rounding.
pub const MAX_DECIMALS: u32 = 12;

/// Render `s` (preferred) or `f` as a plain decimal string truncated toward
/// zero to at most `MAX_DECIMALS` fractional digits. Returns the literal
/// `"None"` when neither input yields a finite decimal.
pub fn format(s: Option<&str>, f: Option<f64>) -> String {
    let decimal = s
        .and_then(parse_finite_str)
        .or_else(|| f.filter(|v| v.is_finite()).and_then(Decimal::from_f64));

    let Some(decimal) = decimal else {
        return "None".to_string();
    };

    canonicalize(decimal)
}

fn parse_finite_str(s: &str) -> Option<Decimal> {
    Decimal::from_str(s.trim()).ok()
}

/// Truncate toward zero to `MAX_DECIMALS`, strip trailing zeros and a
/// trailing decimal point, normalize `-0` to `0`.
fn canonicalize(decimal: Decimal) -> String {
    let truncated = decimal.round_dp_with_strategy(MAX_DECIMALS, RoundingStrategy::ToZero);
    let normalized = truncated.normalize();

    if normalized.is_zero() {
        return "0".to_string();
    }

    normalized.to_string()
}
