//! Canonical trading-pair identifiers.
//!
//! A pair is always `"BASE/QUOTE"` with upper-case alphanumeric asset codes.
//! Venue-specific encodings (`BTC-USDT`, `btc_usdt`, `tBTCUST`, ...) never
//! leave the connector that owns them; see `crate::connectors`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PairParseError {
    #[error("pair {0:?} is missing the '/' separator")]
    MissingSeparator(String),
    #[error("pair {0:?} has a non-alphanumeric asset code")]
    InvalidAssetCode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pair {
    canonical: String,
}

impl Pair {
    pub fn new(base: &str, quote: &str) -> Result<Self, PairParseError> {
        Self::from_str(&format!("{base}/{quote}"))
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    pub fn base(&self) -> &str {
        self.canonical.split('/').next().unwrap_or_default()
    }

    pub fn quote(&self) -> &str {
        self.canonical.split('/').nth(1).unwrap_or_default()
    }
}

fn is_valid_asset_code(code: &str) -> bool {
    !code.is_empty() && code.chars().all(|c| c.is_ascii_alphanumeric())
}

impl FromStr for Pair {
    type Err = PairParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let Some((base, quote)) = upper.split_once('/') else {
            return Err(PairParseError::MissingSeparator(s.to_string()));
        };
        if !is_valid_asset_code(base) || !is_valid_asset_code(quote) {
            return Err(PairParseError::InvalidAssetCode(s.to_string()));
        }
        Ok(Self {
            canonical: format!("{base}/{quote}"),
        })
    }
}

impl TryFrom<String> for Pair {
    type Error = PairParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl From<Pair> for String {
    fn from(pair: Pair) -> Self {
        pair.canonical
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let p: Pair = "btc/usdt".parse().unwrap();
        assert_eq!(p.as_str(), "BTC/USDT");
        assert_eq!(p.base(), "BTC");
        assert_eq!(p.quote(), "USDT");
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(
            "BTCUSDT".parse::<Pair>(),
            Err(PairParseError::MissingSeparator("BTCUSDT".to_string()))
        );
    }

    #[test]
    fn rejects_non_alphanumeric_codes() {
        assert!("BTC-X/USDT".parse::<Pair>().is_err());
    }

    #[test]
    fn new_builds_from_parts() {
        let p = Pair::new("eth", "usdc").unwrap();
        assert_eq!(p.as_str(), "ETH/USDC");
    }
}
