//! The process-wide quote table: `venue -> pair -> Quote`, single writer per
//! key, many readers, whole-record replace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::pair::Pair;
use crate::venue::Venue;

/// Normalized top-of-book for one `(venue, pair)`.
///
/// Writes are always whole-record replacements; partial field updates never
/// appear in the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Quote {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub bid_sz: Option<Decimal>,
    pub ask_sz: Option<Decimal>,
    pub bid_str: Option<String>,
    pub ask_str: Option<String>,
    /// Local receive time in epoch milliseconds. `0` means never updated.
    pub ts_ms: i64,
}

impl Quote {
    pub fn has_any_side(&self) -> bool {
        self.bid.is_some() || self.ask.is_some()
    }
}

/// Where a connector sends its updates. Injected at construction time so
/// connectors never hold a mutable, late-bound callback field.
pub trait QuoteSink: Send + Sync {
    fn publish(&self, venue: Venue, pair: Pair, quote: Quote);
}

/// `venue -> pair -> Quote`, behind a single lock with short critical
/// sections; readers get cloned `Quote` values, never a reference into the
/// lock.
#[derive(Clone, Default)]
pub struct QuoteTable {
    inner: Arc<RwLock<HashMap<Venue, HashMap<Pair, Quote>>>>,
}

impl QuoteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whole-record replace for `(venue, pair)`.
    pub fn put(&self, venue: Venue, pair: Pair, quote: Quote) {
        let mut guard = self.inner.write();
        guard.entry(venue).or_default().insert(pair, quote);
    }

    /// The set of pairs a venue currently has any quote for.
    pub fn supported(&self, venue: Venue) -> HashSet<Pair> {
        self.inner
            .read()
            .get(&venue)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// A materialized copy of the whole table, suitable for one scan pass.
    pub fn snapshot(&self) -> HashMap<Venue, HashMap<Pair, Quote>> {
        self.inner.read().clone()
    }
}

impl QuoteSink for QuoteTable {
    fn publish(&self, venue: Venue, pair: Pair, quote: Quote) {
        self.put(venue, pair, quote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pair(s: &str) -> Pair {
        Pair::from_str(s).unwrap()
    }

    #[test]
    fn put_then_snapshot_round_trips() {
        let table = QuoteTable::new();
        let quote = Quote {
            bid: Some(Decimal::from_str("100.5").unwrap()),
            ..Default::default()
        };
        table.put(Venue::Binance, pair("BTC/USDT"), quote.clone());

        let snap = table.snapshot();
        assert_eq!(snap[&Venue::Binance][&pair("BTC/USDT")], quote);
    }

    #[test]
    fn later_put_is_a_whole_record_replace() {
        let table = QuoteTable::new();
        table.put(
            Venue::Binance,
            pair("BTC/USDT"),
            Quote { bid: Some(Decimal::from_str("1").unwrap()), ask: Some(Decimal::from_str("2").unwrap()), ..Default::default() },
        );
        table.put(
            Venue::Binance,
            pair("BTC/USDT"),
            Quote { bid: Some(Decimal::from_str("3").unwrap()), ..Default::default() },
        );

        let snap = table.snapshot();
        let q = &snap[&Venue::Binance][&pair("BTC/USDT")];
        assert_eq!(q.bid, Some(Decimal::from_str("3").unwrap()));
        assert_eq!(q.ask, None, "a later put replaces the whole record, not just bid");
    }

    #[test]
    fn supported_reflects_observed_pairs_for_that_venue_only() {
        let table = QuoteTable::new();
        table.put(Venue::Binance, pair("BTC/USDT"), Quote::default());
        table.put(Venue::Kraken, pair("ETH/USDT"), Quote::default());

        assert_eq!(table.supported(Venue::Binance), HashSet::from([pair("BTC/USDT")]));
        assert_eq!(table.supported(Venue::Kraken), HashSet::from([pair("ETH/USDT")]));
        assert!(table.supported(Venue::Bybit).is_empty());
    }

    #[test]
    fn quote_table_is_a_quote_sink() {
        let table = QuoteTable::new();
        let sink: &dyn QuoteSink = &table;
        sink.publish(Venue::Okx, pair("SOL/USDT"), Quote::default());
        assert!(table.snapshot()[&Venue::Okx].contains_key(&pair("SOL/USDT")));
    }
}
