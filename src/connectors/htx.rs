//! HTX (Huobi) spot: `market.{symbol}.depth.step0` channel, full-snapshot
//! style (top-of-book taken directly from each frame), gzip-compressed
//! binary frames, app-level ping/pong riding inside the decompressed text.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connectors::{batch_pairs, now_ms, run_with_reconnect, Connector, ConnectorMetrics, DISCOVERY_TIMEOUT};
use crate::pair::Pair;
use crate::quote::{Quote, QuoteSink};
use crate::venue::Venue;

const WS_URL: &str = "wss://api.huobi.pro/ws";
const REST_SYMBOLS: &str = "https://api.huobi.pro/v1/common/symbols";
const SUB_BATCH: usize = 61;

fn venue_symbol(pair: &Pair) -> String {
    format!("{}{}", pair.base(), pair.quote()).to_ascii_lowercase()
}

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    data: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    state: String,
    #[serde(rename = "base-currency")]
    base_currency: String,
    #[serde(rename = "quote-currency")]
    quote_currency: String,
}

#[derive(Debug, Deserialize)]
struct PingFrame {
    ping: i64,
}

#[derive(Debug, Deserialize)]
struct TickFrame {
    ch: String,
    tick: DepthTick,
}

#[derive(Debug, Deserialize, Default)]
struct DepthTick {
    #[serde(default)]
    bids: Vec<(f64, f64)>,
    #[serde(default)]
    asks: Vec<(f64, f64)>,
}

pub struct HtxConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
}

impl HtxConnector {
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

fn decompress(bytes: &[u8]) -> Option<String> {
    let mut decoder = GzDecoder::new(bytes);
    let mut text = String::new();
    decoder.read_to_string(&mut text).ok()?;
    Some(text)
}

async fn consume(symbol_of: &HashMap<String, Pair>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let (ws, _) = connect_async(WS_URL).await.context("htx connect")?;
    let (mut write, mut read) = ws.split();

    for symbol in symbol_of.keys() {
        let sub = json!({ "sub": format!("market.{symbol}.depth.step0"), "id": format!("sub-{symbol}") });
        write.send(Message::Text(sub.to_string())).await.context("htx subscribe")?;
    }

    while let Some(msg) = read.next().await {
        let msg = msg.context("htx ws read")?;
        let text = match msg {
            Message::Binary(bytes) => match decompress(&bytes) {
                Some(t) => t,
                None => {
                    metrics.record_parse_error();
                    continue;
                }
            },
            Message::Text(t) => t,
            Message::Close(_) => return Err(anyhow!("htx ws closed")),
            _ => continue,
        };
        metrics.record_message();

        if let Ok(ping) = serde_json::from_str::<PingFrame>(&text) {
            write.send(Message::Text(json!({ "pong": ping.ping }).to_string())).await.ok();
            continue;
        }

        let Ok(frame) = serde_json::from_str::<TickFrame>(&text) else {
            continue; // subscribe acks and error frames don't match TickFrame
        };

        let Some(symbol) = frame.ch.split('.').nth(1) else { continue };
        let Some(pair) = symbol_of.get(symbol) else { continue };

        publish_top_of_book(pair, &frame.tick, sink, metrics);
    }

    Err(anyhow!("htx ws stream ended"))
}

fn publish_top_of_book(pair: &Pair, tick: &DepthTick, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) {
    let best_bid = tick.bids.first();
    let best_ask = tick.asks.first();
    if best_bid.is_none() && best_ask.is_none() {
        return;
    }

    let ts = now_ms();
    let quote = Quote {
        bid: best_bid.and_then(|(p, _)| Decimal::try_from(*p).ok()),
        bid_sz: best_bid.and_then(|(_, s)| Decimal::try_from(*s).ok()),
        bid_str: best_bid.map(|(p, _)| p.to_string()),
        ask: best_ask.and_then(|(p, _)| Decimal::try_from(*p).ok()),
        ask_sz: best_ask.and_then(|(_, s)| Decimal::try_from(*s).ok()),
        ask_str: best_ask.map(|(p, _)| p.to_string()),
        ts_ms: ts,
    };
    metrics.record_update(ts);
    sink.publish(Venue::Htx, pair.clone(), quote);
}

#[async_trait]
impl Connector for HtxConnector {
    fn venue(&self) -> Venue {
        Venue::Htx
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<SymbolsResponse> = async {
            let resp = self.http.get(REST_SYMBOLS).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let symbols = match result {
            Ok(r) => r.data,
            Err(err) => {
                warn!(error = %err, "htx discovery failed");
                return Vec::new();
            }
        };

        let tradable: std::collections::HashSet<Pair> = symbols
            .into_iter()
            .filter(|it| it.state.eq_ignore_ascii_case("online"))
            .filter_map(|it| Pair::new(&it.base_currency, &it.quote_currency).ok())
            .collect();

        let supported: Vec<Pair> = desired.iter().filter(|p| tradable.contains(p)).cloned().collect();
        info!(count = supported.len(), "htx discovery complete");
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
    fn channel_name_splits_out_the_symbol() {
        let frame: TickFrame = serde_json::from_str(r#"{"ch":"market.btcusdt.depth.step0","tick":{"bids":[[99.0,1.0]],"asks":[[101.0,2.0]]}}"#).unwrap();
        assert_eq!(frame.ch.split('.').nth(1), Some("btcusdt"));
        assert_eq!(frame.tick.bids[0], (99.0, 1.0));
    }

    #[test]
    fn ping_frame_is_recognized() {
        let ping: PingFrame = serde_json::from_str(r#"{"ping":169000000}"#).unwrap();
        assert_eq!(ping.ping, 169000000);
    }

    #[test]
    fn empty_tick_produces_no_quote() {
        let table = crate::quote::QuoteTable::new();
        let metrics = ConnectorMetrics::default();
        let pair = Pair::new("BTC", "USDT").unwrap();
        publish_top_of_book(&pair, &DepthTick::default(), &table, &metrics);
        assert!(table.snapshot().is_empty());
    }
}
