//! Binance spot: `bookTicker` streams over a single combined-stream
//! connection per batch (`wss://.../stream?streams=a@bookTicker/b@bookTicker/...`).
//! Each message already carries the venue's own top-of-book, so there is no
//! local order book to maintain.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connectors::{batch_pairs, now_ms, run_with_reconnect, Connector, ConnectorMetrics, DISCOVERY_TIMEOUT};
use crate::pair::Pair;
use crate::quote::{Quote, QuoteSink};
use crate::venue::Venue;

const STREAM_BASE: &str = "wss://stream.binance.com:9443/stream";
const REST_EXCHANGE_INFO: &str = "https://api.binance.com/api/v3/exchangeInfo";
const SUB_BATCH: usize = 50;

fn venue_symbol(pair: &Pair) -> String {
    format!("{}{}", pair.base(), pair.quote()).to_ascii_lowercase()
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    #[serde(rename = "baseAsset")]
    base_asset: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct CombinedStreamFrame {
    data: BookTicker,
}

#[derive(Debug, Deserialize)]
struct BookTicker {
    s: String,
    b: String,
    #[serde(rename = "B")]
    bid_qty: String,
    a: String,
    #[serde(rename = "A")]
    ask_qty: String,
}

pub struct BinanceConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
}

impl BinanceConnector {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), metrics: Arc::new(ConnectorMetrics::default()) }
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }
}

async fn run_batch(batch: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken, metrics: Arc<ConnectorMetrics>) {
    let symbol_of: HashMap<String, Pair> = batch.iter().map(|p| (venue_symbol(p), p.clone())).collect();
    run_with_reconnect(&cancel, &metrics, || {
        let symbol_of = symbol_of.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move { consume(&symbol_of, sink.as_ref(), &metrics).await }
    })
    .await;
}

async fn consume(symbol_of: &HashMap<String, Pair>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let streams: Vec<String> = symbol_of.keys().map(|s| format!("{s}@bookTicker")).collect();
    let url = format!("{STREAM_BASE}?streams={}", streams.join("/"));

    let (ws, _) = connect_async(&url).await.context("binance connect")?;
    let (_, mut read) = ws.split();

    while let Some(msg) = read.next().await {
        let msg = msg.context("binance ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(anyhow!("binance ws closed")),
            _ => continue,
        };
        metrics.record_message();

        let Ok(frame) = serde_json::from_str::<CombinedStreamFrame>(&text) else {
            metrics.record_parse_error();
            continue;
        };

        let symbol = frame.data.s.to_ascii_lowercase();
        let Some(pair) = symbol_of.get(&symbol) else { continue };

        publish(pair, &frame.data, sink, metrics);
    }

    Err(anyhow!("binance ws stream ended"))
}

fn publish(pair: &Pair, ticker: &BookTicker, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) {
    let bid = ticker.b.parse::<Decimal>().ok();
    let ask = ticker.a.parse::<Decimal>().ok();
    if bid.is_none() && ask.is_none() {
        return;
    }

    let ts = now_ms();
    let quote = Quote {
        bid,
        bid_sz: ticker.bid_qty.parse::<Decimal>().ok(),
        bid_str: bid.is_some().then(|| ticker.b.clone()),
        ask,
        ask_sz: ticker.ask_qty.parse::<Decimal>().ok(),
        ask_str: ask.is_some().then(|| ticker.a.clone()),
        ts_ms: ts,
    };
    metrics.record_update(ts);
    sink.publish(Venue::Binance, pair.clone(), quote);
}

#[async_trait]
impl Connector for BinanceConnector {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<ExchangeInfoResponse> = async {
            let resp = self.http.get(REST_EXCHANGE_INFO).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let symbols = match result {
            Ok(r) => r.symbols,
            Err(err) => {
                warn!(error = %err, "binance discovery failed");
                return Vec::new();
            }
        };

        let tradable: std::collections::HashSet<Pair> = symbols
            .into_iter()
            .filter(|s| s.status.eq_ignore_ascii_case("trading"))
            .filter_map(|s| Pair::new(&s.base_asset, &s.quote_asset).ok())
            .collect();

        let supported: Vec<Pair> = desired.iter().filter(|p| tradable.contains(p)).cloned().collect();
        info!(count = supported.len(), "binance discovery complete");
        supported
    }

    async fn run(&self, supported: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken) {
        if supported.is_empty() {
            return;
        }
        let batches = batch_pairs(&supported, SUB_BATCH);
        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let sink = sink.clone();
                let cancel = cancel.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    run_batch(batch, sink, cancel, metrics).await;
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbol_is_lowercase_and_unseparated() {
        let pair = Pair::new("BTC", "USDT").unwrap();
        assert_eq!(venue_symbol(&pair), "btcusdt");
    }

    #[test]
    fn combined_stream_frame_parses_the_book_ticker_payload() {
        let json = r#"{"stream":"btcusdt@bookTicker","data":{"u":12345,"s":"BTCUSDT","b":"50000.00","B":"1.5","a":"50001.00","A":"2.0"}}"#;
        let frame: CombinedStreamFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.data.s, "BTCUSDT");
        assert_eq!(frame.data.b, "50000.00");
    }

    #[test]
    fn publish_is_skipped_when_both_sides_fail_to_parse() {
        let table = crate::quote::QuoteTable::new();
        let metrics = ConnectorMetrics::default();
        let pair = Pair::new("BTC", "USDT").unwrap();
        let ticker = BookTicker { s: "BTCUSDT".into(), b: "nan".into(), bid_qty: "1".into(), a: "nan".into(), ask_qty: "1".into() };
        publish(&pair, &ticker, &table, &metrics);
        assert!(table.snapshot().is_empty());
    }
}
