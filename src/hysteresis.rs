//! Per-opportunity-key hysteresis: tracks whether a `(pair, buy, sell)`
//! triple is currently "in-window" and, if so, since when.

use std::collections::HashMap;

use crate::pair::Pair;
use crate::venue::Venue;

/// Identity used by hysteresis and external alert deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OppKey {
    pub pair: Pair,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
}

impl OppKey {
    pub fn new(pair: Pair, buy_venue: Venue, sell_venue: Venue) -> Self {
        Self { pair, buy_venue, sell_venue }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct State {
    in_window: bool,
    since_ms: Option<i64>,
}

/// Thresholds shared across all keys. `exit < enter` is an invariant of
/// configuration, not enforced here.
#[derive(Debug, Clone, Copy)]
pub struct HysteresisParams {
    pub thresh_enter: f64,
    pub thresh_exit: f64,
    pub long_ms: i64,
}

/// Owned exclusively by the arbitrage engine; mutated only during a scan.
#[derive(Debug, Default)]
pub struct HysteresisTable {
    states: HashMap<OppKey, State>,
}

impl HysteresisTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one observation. Only called for keys actually observed in a
    /// scan; non-observation is never treated as an exit.
    pub fn observe(&mut self, key: &OppKey, profit_frac: f64, now_ms: i64, params: &HysteresisParams) {
        let state = self.states.entry(key.clone()).or_default();
        if !state.in_window && profit_frac >= params.thresh_enter {
            state.in_window = true;
            state.since_ms = Some(now_ms);
        } else if state.in_window && profit_frac < params.thresh_exit {
            state.in_window = false;
            state.since_ms = None;
        }
    }

    pub fn is_in_window(&self, key: &OppKey) -> bool {
        self.states.get(key).map(|s| s.in_window).unwrap_or(false)
    }

    /// `in_window && since_ms is set && now_ms - since_ms >= long_ms`.
    pub fn is_long(&self, key: &OppKey, now_ms: i64, long_ms: i64) -> bool {
        match self.states.get(key) {
            Some(state) if state.in_window => {
                state.since_ms.map(|since| now_ms - since >= long_ms).unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn key() -> OppKey {
        OppKey::new(Pair::from_str("X/Y").unwrap(), Venue::Binance, Venue::Kraken)
    }

    fn params() -> HysteresisParams {
        HysteresisParams { thresh_enter: 0.004, thresh_exit: 0.003, long_ms: 60_000 }
    }

    #[test]
    fn stays_out_of_window_below_enter_threshold() {
        let mut table = HysteresisTable::new();
        let k = key();
        table.observe(&k, 0.001, 0, &params());
        table.observe(&k, 0.002, 1000, &params());
        assert!(!table.is_in_window(&k));
    }

    #[test]
    fn single_observation_above_enter_opens_the_window() {
        let mut table = HysteresisTable::new();
        let k = key();
        table.observe(&k, 0.005, 1234, &params());
        assert!(table.is_in_window(&k));
    }

    #[test]
    fn stays_in_window_through_the_exit_gap() {
        let mut table = HysteresisTable::new();
        let k = key();
        let p = params();
        table.observe(&k, 0.005, 0, &p);
        table.observe(&k, 0.0035, 1000, &p); // in [exit, enter)
        assert!(table.is_in_window(&k));
    }

    #[test]
    fn exits_below_exit_threshold() {
        let mut table = HysteresisTable::new();
        let k = key();
        let p = params();
        table.observe(&k, 0.005, 0, &p);
        table.observe(&k, 0.002, 1000, &p);
        assert!(!table.is_in_window(&k));

        // re-entering the gap afterwards is not enough to re-open.
        table.observe(&k, 0.0035, 2000, &p);
        assert!(!table.is_in_window(&k));
    }

    #[test]
    fn long_promotion_happens_exactly_at_long_ms() {
        let mut table = HysteresisTable::new();
        let k = key();
        let p = params();
        table.observe(&k, 0.005, 0, &p);
        table.observe(&k, 0.005, 59_900, &p);
        assert!(!table.is_long(&k, 59_900, p.long_ms));
        table.observe(&k, 0.005, 60_100, &p);
        assert!(table.is_long(&k, 60_100, p.long_ms));
    }

    #[test]
    fn exit_resets_the_long_clock() {
        let mut table = HysteresisTable::new();
        let k = key();
        let p = params();
        table.observe(&k, 0.005, 0, &p);
        table.observe(&k, 0.001, 70_000, &p); // exit
        table.observe(&k, 0.005, 70_100, &p); // re-enter, clock restarts
        assert!(!table.is_long(&k, 130_000, p.long_ms));
        assert!(table.is_long(&k, 130_200, p.long_ms));
    }

    #[test]
    fn unobserved_key_is_never_in_window() {
        let table = HysteresisTable::new();
        assert!(!table.is_in_window(&key()));
        assert!(!table.is_long(&key(), 1_000_000, 60_000));
    }
}
