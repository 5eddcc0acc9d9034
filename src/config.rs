//! Run-start configuration, loaded from the environment.

use crate::venue::Venue;

#[derive(Debug, Clone)]
pub struct Config {
    pub max_decimals: u32,
    pub thresh_enter_pct: f64,
    pub thresh_exit_pct: f64,
    pub max_profit_pct: f64,
    pub long_secs: f64,
    pub stale_secs: f64,
    pub venues: Vec<Venue>,
    /// Desired pairs for the standalone binary; the library entry point
    /// takes pairs as a parameter instead.
    pub desired_pairs: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

impl Config {
    /// Load from `.env` (if present) then the process environment, falling
    /// back to the reference defaults for any field that is unset or fails
    /// to parse.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let venues = env_list("VENUES", &["binance", "bybit", "kraken", "bitfinex", "htx", "kucoin", "okx", "coinbase"])
            .iter()
            .filter_map(|s| Venue::from_str_loose(s))
            .collect();

        let desired_pairs = env_list("DESIRED_PAIRS", &["BTC/USDT", "ETH/USDT"]);

        Self {
            max_decimals: env_or("MAX_DECIMALS", 12),
            thresh_enter_pct: env_or("THRESH_ENTER_PCT", 0.40),
            thresh_exit_pct: env_or("THRESH_EXIT_PCT", 0.30),
            max_profit_pct: env_or("MAX_PROFIT_PCT", 10.0),
            long_secs: env_or("LONG_SECS", 60.0),
            stale_secs: env_or("STALE_SECS", 30.0),
            venues,
            desired_pairs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing_var() {
        std::env::remove_var("ARBSCAN_TEST_UNSET");
        let v: f64 = env_or("ARBSCAN_TEST_UNSET", 1.5);
        assert_eq!(v, 1.5);
    }

    #[test]
    fn env_or_falls_back_on_unparsable_var() {
        std::env::set_var("ARBSCAN_TEST_BAD", "not-a-number");
        let v: f64 = env_or("ARBSCAN_TEST_BAD", 2.5);
        assert_eq!(v, 2.5);
        std::env::remove_var("ARBSCAN_TEST_BAD");
    }

    #[test]
    fn env_list_splits_and_trims_on_commas() {
        std::env::set_var("ARBSCAN_TEST_LIST", "binance, kraken ,okx");
        let v = env_list("ARBSCAN_TEST_LIST", &["fallback"]);
        assert_eq!(v, vec!["binance", "kraken", "okx"]);
        std::env::remove_var("ARBSCAN_TEST_LIST");
    }
}
