//! Per-connector, per-pair order-book level store.
//!
//! Owned exclusively by the connector session that maintains it; never
//! shared across tasks. Keyed by `Decimal` rather than `f64` so that two
//! representations of the same price never collide or fail to collide
//! depending on binary floating-point rounding.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

/// Which side of the book a level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level's size, plus the venue's original decimal string when one
/// was supplied (kept for lossless rendering downstream).
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    pub size: Decimal,
    pub size_str: Option<String>,
}

/// Two price-keyed maps, one per side. Bids keep their best price at the
/// high end of the map, asks at the low end, so `best` is a single
/// `BTreeMap` lookup in either direction.
#[derive(Debug, Default, Clone)]
pub struct OrderBook {
    bids: BTreeMap<Decimal, Level>,
    asks: BTreeMap<Decimal, Level>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn side_map(&mut self, side: Side) -> &mut BTreeMap<Decimal, Level> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn side_map_ref(&self, side: Side) -> &BTreeMap<Decimal, Level> {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Insert, replace, or (if `size` is zero) remove a level.
    pub fn apply(&mut self, side: Side, price: Decimal, size: Decimal, size_str: Option<String>) {
        let map = self.side_map(side);
        if size.is_zero() {
            map.remove(&price);
        } else {
            map.insert(price, Level { size, size_str });
        }
    }

    /// Clear both sides. Used when a venue delivers a fresh snapshot.
    pub fn reset(&mut self) {
        self.bids.clear();
        self.asks.clear();
    }

    /// The extremal price on `side` and its level: max for bids, min for asks.
    pub fn best(&self, side: Side) -> Option<(Decimal, &Level)> {
        let map = self.side_map_ref(side);
        match side {
            Side::Bid => map.last_key_value().map(|(p, l)| (*p, l)),
            Side::Ask => map.first_key_value().map(|(p, l)| (*p, l)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn best_bid_is_the_maximum_price() {
        let mut book = OrderBook::new();
        book.apply(Side::Bid, d("100.0"), d("1"), None);
        book.apply(Side::Bid, d("101.5"), d("2"), None);
        book.apply(Side::Bid, d("99.0"), d("3"), None);
        let (price, level) = book.best(Side::Bid).unwrap();
        assert_eq!(price, d("101.5"));
        assert_eq!(level.size, d("2"));
    }

    #[test]
    fn best_ask_is_the_minimum_price() {
        let mut book = OrderBook::new();
        book.apply(Side::Ask, d("100.0"), d("1"), None);
        book.apply(Side::Ask, d("98.5"), d("2"), None);
        let (price, _) = book.best(Side::Ask).unwrap();
        assert_eq!(price, d("98.5"));
    }

    #[test]
    fn zero_size_removes_the_level() {
        let mut book = OrderBook::new();
        book.apply(Side::Bid, d("100.0"), d("1"), None);
        book.apply(Side::Bid, d("100.0"), d("0"), None);
        assert!(book.best(Side::Bid).is_none());
    }

    #[test]
    fn reset_clears_both_sides() {
        let mut book = OrderBook::new();
        book.apply(Side::Bid, d("100.0"), d("1"), None);
        book.apply(Side::Ask, d("101.0"), d("1"), None);
        book.reset();
        assert!(book.is_empty());
    }

    #[test]
    fn best_on_empty_side_is_none() {
        let book = OrderBook::new();
        assert!(book.best(Side::Bid).is_none());
        assert!(book.best(Side::Ask).is_none());
    }

    #[test]
    fn reconnect_scenario_rebuilds_from_fresh_snapshot() {
        // a stale level from a prior session must not survive a reset.
        let mut book = OrderBook::new();
        book.apply(Side::Bid, d("99"), d("1"), None);
        book.apply(Side::Ask, d("101"), d("1"), None);
        book.reset();
        book.apply(Side::Bid, d("98"), d("1"), None);
        book.apply(Side::Ask, d("100"), d("1"), None);
        assert_eq!(book.best(Side::Bid).unwrap().0, d("98"));
        assert_eq!(book.best(Side::Ask).unwrap().0, d("100"));
    }

    #[test]
    fn apply_does_not_depend_on_insertion_order() {
        let mut descending = OrderBook::new();
        descending.apply(Side::Bid, d("100"), d("1"), None);
        descending.apply(Side::Bid, d("50"), d("1"), None);
        descending.apply(Side::Bid, d("75"), d("1"), None);

        let mut ascending = OrderBook::new();
        ascending.apply(Side::Bid, d("50"), d("1"), None);
        ascending.apply(Side::Bid, d("75"), d("1"), None);
        ascending.apply(Side::Bid, d("100"), d("1"), None);

        assert_eq!(descending.best(Side::Bid).unwrap().0, ascending.best(Side::Bid).unwrap().0);
    }
}
