//! Kraken spot: `book` subscription channel, snapshot+delta, XBT/BTC asset
//! remap, numeric channel IDs resolved via the subscription ack.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::book::{OrderBook, Side};
use crate::connectors::{batch_pairs, now_ms, run_with_reconnect, Connector, ConnectorMetrics, DISCOVERY_TIMEOUT};
use crate::pair::Pair;
use crate::quote::{Quote, QuoteSink};
use crate::venue::Venue;

const WS_URL: &str = "wss://ws.kraken.com/";
const REST_ASSET_PAIRS: &str = "https://api.kraken.com/0/public/AssetPairs";
const SUB_BATCH: usize = 60;
const BOOK_DEPTH: u32 = 10;

fn ws_to_human(code: &str) -> &str {
    match code {
        "XBT" => "BTC",
        other => other,
    }
}

fn human_to_ws(code: &str) -> &str {
    match code {
        "BTC" => "XBT",
        other => other,
    }
}

fn wsname_to_pair(wsname: &str) -> Option<Pair> {
    let (base, quote) = wsname.split_once('/')?;
    Pair::new(ws_to_human(base), ws_to_human(quote)).ok()
}

fn pair_to_wsname(pair: &Pair) -> String {
    format!("{}/{}", human_to_ws(pair.base()), human_to_ws(pair.quote()))
}

#[derive(Debug, Deserialize)]
struct AssetPairsResponse {
    result: HashMap<String, AssetPairInfo>,
}

#[derive(Debug, Deserialize)]
struct AssetPairInfo {
    wsname: Option<String>,
}

pub struct KrakenConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
    pair_to_wsname: RwLock<HashMap<Pair, String>>,
}

impl KrakenConnector {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), metrics: Arc::new(ConnectorMetrics::default()), pair_to_wsname: RwLock::new(HashMap::new()) }
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }
}

async fn run_batch(batch: Vec<Pair>, wsnames: HashMap<Pair, String>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken, metrics: Arc<ConnectorMetrics>) {
    run_with_reconnect(&cancel, &metrics, || {
        let batch = batch.clone();
        let wsnames = wsnames.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move { consume(&batch, &wsnames, sink.as_ref(), &metrics).await }
    })
    .await;
}

async fn consume(batch: &[Pair], wsnames: &HashMap<Pair, String>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let (ws, _) = connect_async(WS_URL).await.context("kraken connect")?;
    let (mut write, mut read) = ws.split();

    let pair_list: Vec<&String> = batch.iter().filter_map(|p| wsnames.get(p)).collect();
    if pair_list.is_empty() {
        return Ok(());
    }

    let sub = json!({
        "event": "subscribe",
        "pair": pair_list,
        "subscription": { "name": "book", "depth": BOOK_DEPTH },
    });
    write.send(Message::Text(sub.to_string())).await.context("kraken subscribe")?;

    let mut books: HashMap<Pair, OrderBook> = batch.iter().cloned().map(|p| (p, OrderBook::new())).collect();
    let mut chan_to_pair: HashMap<i64, Pair> = HashMap::new();

    while let Some(msg) = read.next().await {
        let msg = msg.context("kraken ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(anyhow!("kraken ws closed")),
            _ => continue,
        };
        metrics.record_message();

        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            metrics.record_parse_error();
            continue;
        };

        if let Some(obj) = value.as_object() {
            if obj.get("event").and_then(Value::as_str) == Some("subscriptionStatus")
                && obj.get("status").and_then(Value::as_str) == Some("subscribed")
                && obj.get("channelName").and_then(Value::as_str).is_some_and(|n| n.starts_with("book"))
            {
                if let (Some(cid), Some(wsname)) = (obj.get("channelID").and_then(Value::as_i64), obj.get("pair").and_then(Value::as_str)) {
                    if let Some(pair) = wsname_to_pair(wsname) {
                        if batch.contains(&pair) {
                            chan_to_pair.insert(cid, pair);
                        }
                    }
                }
            }
            continue;
        }

        let Some(arr) = value.as_array() else { continue };
        if arr.len() < 2 {
            continue;
        }
        let Some(cid) = arr[0].as_i64() else { continue };
        let Some(pair) = chan_to_pair.get(&cid) else { continue };
        let Some(payload) = arr[1].as_object() else { continue };
        let Some(book) = books.get_mut(pair) else { continue };

        if payload.contains_key("as") || payload.contains_key("bs") {
            book.reset();
            apply_field(book, payload, "bs", Side::Bid);
            apply_field(book, payload, "as", Side::Ask);
        }
        if payload.contains_key("a") || payload.contains_key("b") {
            apply_field(book, payload, "b", Side::Bid);
            apply_field(book, payload, "a", Side::Ask);
        }

        publish_best(pair, book, sink, metrics);
    }

    Err(anyhow!("kraken ws stream ended"))
}

fn apply_field(book: &mut OrderBook, payload: &serde_json::Map<String, Value>, key: &str, side: Side) {
    let Some(levels) = payload.get(key).and_then(Value::as_array) else { return };
    for level in levels {
        let Some(level) = level.as_array() else { continue };
        let (Some(price_str), Some(size_str)) = (level.first().and_then(Value::as_str), level.get(1).and_then(Value::as_str)) else { continue };
        let (Ok(price), Ok(size)) = (price_str.parse::<Decimal>(), size_str.parse::<Decimal>()) else { continue };
        book.apply(side, price, size, Some(size_str.to_string()));
    }
}

fn publish_best(pair: &Pair, book: &OrderBook, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) {
    let bid = book.best(Side::Bid);
    let ask = book.best(Side::Ask);
    if bid.is_none() && ask.is_none() {
        return;
    }
    let ts = now_ms();
    let quote = Quote {
        bid: bid.map(|(p, _)| p),
        bid_sz: bid.map(|(_, l)| l.size),
        bid_str: bid.map(|(p, _)| p.to_string()),
        ask: ask.map(|(p, _)| p),
        ask_sz: ask.map(|(_, l)| l.size),
        ask_str: ask.map(|(p, _)| p.to_string()),
        ts_ms: ts,
    };
    metrics.record_update(ts);
    sink.publish(Venue::Kraken, pair.clone(), quote);
}

#[async_trait]
impl Connector for KrakenConnector {
    fn venue(&self) -> Venue {
        Venue::Kraken
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<AssetPairsResponse> = async {
            let resp = self.http.get(REST_ASSET_PAIRS).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let pairs = match result {
            Ok(r) => r.result,
            Err(err) => {
                warn!(error = %err, "kraken discovery failed");
                return Vec::new();
            }
        };

        let desired_set: std::collections::HashSet<&Pair> = desired.iter().collect();
        let mut mapping = HashMap::new();
        let mut supported = Vec::new();
        for info in pairs.into_values() {
            let Some(wsname) = info.wsname else { continue };
            let Some(human) = wsname_to_pair(&wsname) else { continue };
            if desired_set.contains(&human) {
                mapping.insert(human.clone(), wsname);
                supported.push(human);
            }
        }
        *self.pair_to_wsname.write() = mapping;
        info!(count = supported.len(), "kraken discovery complete");
        supported
    }

    async fn run(&self, supported: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken) {
        if supported.is_empty() {
            return;
        }

        {
            let mut mapping = self.pair_to_wsname.write();
            for pair in &supported {
                mapping.entry(pair.clone()).or_insert_with(|| pair_to_wsname(pair));
            }
        }
        let wsnames = self.pair_to_wsname.read().clone();

        let batches = batch_pairs(&supported, SUB_BATCH);
        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let sink = sink.clone();
                let cancel = cancel.clone();
                let metrics = self.metrics.clone();
                let wsnames = wsnames.clone();
                tokio::spawn(async move {
                    run_batch(batch, wsnames, sink, cancel, metrics).await;
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
    fn remaps_xbt_to_btc_in_both_directions() {
        assert_eq!(ws_to_human("XBT"), "BTC");
        assert_eq!(human_to_ws("BTC"), "XBT");
        assert_eq!(ws_to_human("USD"), "USD");
    }

    #[test]
    fn wsname_round_trips_through_pair() {
        let pair = wsname_to_pair("XBT/USD").unwrap();
        assert_eq!(pair.as_str(), "BTC/USD");
        assert_eq!(pair_to_wsname(&pair), "XBT/USD");
    }

    #[test]
    fn snapshot_replaces_deltas_and_best_levels_track_correctly() {
        let mut book = OrderBook::new();
        let payload: serde_json::Map<String, Value> =
            serde_json::from_str(r#"{"bs": [["99.0","1.0"]], "as": [["101.0","2.0"]]}"#).unwrap();
        book.reset();
        apply_field(&mut book, &payload, "bs", Side::Bid);
        apply_field(&mut book, &payload, "as", Side::Ask);
        assert_eq!(book.best(Side::Bid).unwrap().0, Decimal::new(990, 1));
        assert_eq!(book.best(Side::Ask).unwrap().0, Decimal::new(1010, 1));
    }
}
