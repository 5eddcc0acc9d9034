//! The arbitrage engine: scans the quote table, applies hysteresis and the
//! sanity cap, ranks opportunities, and reports stale quotes.

use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::hysteresis::{HysteresisParams, HysteresisTable, OppKey};
use crate::pair::Pair;
use crate::quote::{Quote, QuoteTable};
use crate::venue::Venue;

/// One ranked cross-venue opportunity produced by a `compute()` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Opportunity {
    pub pair: Pair,
    pub buy_venue: Venue,
    pub sell_venue: Venue,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub buy_price_str: Option<String>,
    pub sell_price_str: Option<String>,
    pub profit_pct: f64,
    pub buy_qty: Decimal,
    pub sell_qty: Decimal,
    pub exec_qty: Decimal,
    pub buy_age_sec: f64,
    pub sell_age_sec: f64,
    pub long: bool,
}

/// A quote whose age exceeds `STALE_SECS`.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleEntry {
    pub venue: Venue,
    pub pair: Pair,
    pub age_sec: f64,
    pub quote: Quote,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub thresh_enter_pct: f64,
    pub thresh_exit_pct: f64,
    pub max_profit_pct: f64,
    pub long_secs: f64,
    pub stale_secs: f64,
}

impl EngineConfig {
    fn hysteresis_params(&self) -> HysteresisParams {
        HysteresisParams {
            thresh_enter: self.thresh_enter_pct / 100.0,
            thresh_exit: self.thresh_exit_pct / 100.0,
            long_ms: (self.long_secs * 1000.0) as i64,
        }
    }
}

/// Cheap pre-check for whether a `(ask, bid)` pair could possibly clear the
/// enter threshold, without touching hysteresis or sizes. Callers that only
/// need a fast yes/no (e.g. a UI highlighting candidates) can skip a full
/// `compute()` pass.
pub fn quick_check(buy_ask: Decimal, sell_bid: Decimal, thresh_enter_pct: f64) -> bool {
    if buy_ask.is_zero() {
        return false;
    }
    let profit_frac = (sell_bid - buy_ask) / buy_ask;
    profit_frac >= Decimal::try_from(thresh_enter_pct / 100.0).unwrap_or_default()
}

/// Owns hysteresis state for the process lifetime. Hysteresis state is
/// mutated only from `compute()`; the mutex serializes concurrent callers
/// per the concurrency contract.
pub struct ArbitrageEngine {
    config: EngineConfig,
    hysteresis: Mutex<HysteresisTable>,
}

impl ArbitrageEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, hysteresis: Mutex::new(HysteresisTable::new()) }
    }

    /// Scan the quote table, update hysteresis, and return in-window
    /// opportunities ranked by `profit_pct` descending.
    pub fn compute(&self, quotes: &QuoteTable, now_ms: i64) -> Vec<Opportunity> {
        let snapshot = quotes.snapshot();
        let params = self.config.hysteresis_params();

        // pair -> [(venue, Quote)] with both sides present.
        let mut by_pair: std::collections::HashMap<&Pair, Vec<(Venue, &Quote)>> =
            std::collections::HashMap::new();
        for (venue, pairs) in &snapshot {
            for (pair, quote) in pairs {
                if quote.bid.is_some() && quote.ask.is_some() {
                    by_pair.entry(pair).or_default().push((*venue, quote));
                }
            }
        }

        let mut hysteresis = self.hysteresis.lock();
        let mut opportunities = Vec::new();

        for (pair, avail) in &by_pair {
            for &(buy_venue, buy_quote) in avail {
                for &(sell_venue, sell_quote) in avail {
                    if buy_venue == sell_venue {
                        continue;
                    }
                    let (Some(buy_ask), Some(sell_bid)) = (buy_quote.ask, sell_quote.bid) else {
                        continue;
                    };
                    let (Some(ask_sz), Some(bid_sz)) = (buy_quote.ask_sz, sell_quote.bid_sz) else {
                        continue;
                    };
                    if buy_ask.is_zero() {
                        continue;
                    }

                    let profit_frac = ((sell_bid - buy_ask) / buy_ask).to_f64().unwrap_or(0.0);
                    let profit_pct = profit_frac * 100.0;

                    if profit_pct > self.config.max_profit_pct {
                        continue;
                    }

                    let key = OppKey::new((*pair).clone(), buy_venue, sell_venue);
                    hysteresis.observe(&key, profit_frac, now_ms, &params);

                    if !hysteresis.is_in_window(&key) {
                        continue;
                    }

                    let buy_age_sec = ((now_ms - buy_quote.ts_ms).max(0)) as f64 / 1000.0;
                    let sell_age_sec = ((now_ms - sell_quote.ts_ms).max(0)) as f64 / 1000.0;
                    let long = hysteresis.is_long(&key, now_ms, params.long_ms);

                    opportunities.push(Opportunity {
                        pair: (*pair).clone(),
                        buy_venue,
                        sell_venue,
                        buy_price: buy_ask,
                        sell_price: sell_bid,
                        buy_price_str: buy_quote.ask_str.clone(),
                        sell_price_str: sell_quote.bid_str.clone(),
                        profit_pct,
                        buy_qty: ask_sz,
                        sell_qty: bid_sz,
                        exec_qty: ask_sz.min(bid_sz),
                        buy_age_sec,
                        sell_age_sec,
                        long,
                    });
                }
            }
        }

        opportunities.sort_by(|a, b| b.profit_pct.partial_cmp(&a.profit_pct).unwrap_or(std::cmp::Ordering::Equal));
        opportunities
    }

    /// Every stored quote whose age exceeds `STALE_SECS`, sorted by age
    /// descending then venue then pair.
    pub fn list_stale(&self, quotes: &QuoteTable, now_ms: i64) -> Vec<StaleEntry> {
        let snapshot = quotes.snapshot();
        let stale_ms = (self.config.stale_secs * 1000.0) as i64;

        let mut stale: Vec<StaleEntry> = snapshot
            .into_iter()
            .flat_map(|(venue, pairs)| {
                pairs.into_iter().filter_map(move |(pair, quote)| {
                    let age_ms = now_ms - quote.ts_ms;
                    if age_ms >= stale_ms {
                        Some(StaleEntry { venue, pair, age_sec: age_ms as f64 / 1000.0, quote })
                    } else {
                        None
                    }
                })
            })
            .collect();

        stale.sort_by(|a, b| {
            b.age_sec
                .partial_cmp(&a.age_sec)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.venue.cmp(&b.venue))
                .then_with(|| a.pair.cmp(&b.pair))
        });
        stale
    }
}
