//! End-to-end exercise of the quote table, engine, and supervisor wiring
//! together, without any network I/O.

use std::str::FromStr;

use arbscan_core::engine::{ArbitrageEngine, EngineConfig};
use arbscan_core::{Pair, Quote, QuoteSink, QuoteTable, Venue};
use rust_decimal::Decimal;

fn engine_config() -> EngineConfig {
    EngineConfig { thresh_enter_pct: 0.40, thresh_exit_pct: 0.30, max_profit_pct: 10.0, long_secs: 60.0, stale_secs: 30.0 }
}

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

#[test]
fn quote_table_and_engine_agree_on_a_cross_venue_opportunity() {
    let table = QuoteTable::new();
    let pair = Pair::new("BTC", "USDT").unwrap();

    table.publish(
        Venue::Binance,
        pair.clone(),
        Quote { ask: Some(d("100.00")), ask_sz: Some(d("1.5")), ts_ms: 0, ..Default::default() },
    );
    table.publish(
        Venue::Kraken,
        pair.clone(),
        Quote { bid: Some(d("100.60")), bid_sz: Some(d("2.0")), ts_ms: 0, ..Default::default() },
    );

    let engine = ArbitrageEngine::new(engine_config());
    let opps = engine.compute(&table, 0);

    assert_eq!(opps.len(), 1);
    let opp = &opps[0];
    assert_eq!(opp.pair, pair);
    assert_eq!(opp.buy_venue, Venue::Binance);
    assert_eq!(opp.sell_venue, Venue::Kraken);
    assert_eq!(opp.exec_qty, d("1.5"));
    assert!((opp.profit_pct - 0.60).abs() < 1e-9);
    assert!(!opp.long);
}

#[test]
fn an_opportunity_graduates_to_long_after_sixty_seconds_in_window() {
    let table = QuoteTable::new();
    let pair = Pair::new("ETH", "USDT").unwrap();
    let engine = ArbitrageEngine::new(engine_config());

    table.publish(Venue::Binance, pair.clone(), Quote { ask: Some(d("2000.00")), ask_sz: Some(d("1")), ts_ms: 0, ..Default::default() });
    table.publish(Venue::Okx, pair.clone(), Quote { bid: Some(d("2010.00")), bid_sz: Some(d("1")), ts_ms: 0, ..Default::default() });
    engine.compute(&table, 0);

    table.publish(Venue::Okx, pair.clone(), Quote { bid: Some(d("2010.00")), bid_sz: Some(d("1")), ts_ms: 61_000, ..Default::default() });
    let opps = engine.compute(&table, 61_000);

    assert_eq!(opps.len(), 1);
    assert!(opps[0].long);
}

#[test]
fn stale_quotes_disappear_from_the_opportunity_scan_inputs_but_are_still_listed() {
    let table = QuoteTable::new();
    let pair = Pair::new("SOL", "USDT").unwrap();
    let engine = ArbitrageEngine::new(engine_config());

    table.publish(Venue::Bybit, pair.clone(), Quote { bid: Some(d("140.0")), bid_sz: Some(d("5")), ask: Some(d("140.1")), ask_sz: Some(d("5")), ts_ms: 0, ..Default::default() });

    let stale = engine.list_stale(&table, 30_000);
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].venue, Venue::Bybit);
    assert!((stale[0].age_sec - 30.0).abs() < 1e-9);

    // Engine still scans stale quotes for opportunities; staleness only
    // affects list_stale, never compute()'s inputs.
    assert!(engine.compute(&table, 30_000).is_empty(), "a single venue alone never produces an opportunity");
}
