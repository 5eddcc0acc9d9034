//! The fixed roster of exchange venues the scanner knows how to connect to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One exchange venue. Each variant has exactly one `Connector` implementation
/// in `crate::connectors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Kraken,
    Bitfinex,
    Htx,
    Kucoin,
    Okx,
    Coinbase,
}

impl Venue {
    pub const ALL: [Venue; 8] = [
        Venue::Binance,
        Venue::Bybit,
        Venue::Kraken,
        Venue::Bitfinex,
        Venue::Htx,
        Venue::Kucoin,
        Venue::Okx,
        Venue::Coinbase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Binance => "binance",
            Venue::Bybit => "bybit",
            Venue::Kraken => "kraken",
            Venue::Bitfinex => "bitfinex",
            Venue::Htx => "htx",
            Venue::Kucoin => "kucoin",
            Venue::Okx => "okx",
            Venue::Coinbase => "coinbase",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Some(Venue::Binance),
            "bybit" => Some(Venue::Bybit),
            "kraken" => Some(Venue::Kraken),
            "bitfinex" => Some(Venue::Bitfinex),
            "htx" | "huobi" => Some(Venue::Htx),
            "kucoin" => Some(Venue::Kucoin),
            "okx" => Some(Venue::Okx),
            "coinbase" => Some(Venue::Coinbase),
            _ => None,
        }
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_str() {
        for v in Venue::ALL {
            assert_eq!(Venue::from_str_loose(v.as_str()), Some(v));
        }
    }

    #[test]
    fn unknown_venue_name_is_none() {
        assert_eq!(Venue::from_str_loose("deribit"), None);
    }
}
