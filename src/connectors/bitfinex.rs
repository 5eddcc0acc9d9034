//! Bitfinex spot: `book` channel, quote-code remap (USDT->UST, USDC->UDC),
//! per-symbol subscribe frames, channel-ID indirection via the subscribed ack.
//! Side is carried by the sign of `amount` rather than a separate field.

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

const WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";
const REST_CONF: &str = "https://api-pub.bitfinex.com/v2/conf/pub:list:pair:exchange";
const SUB_BATCH: usize = 35;
const BOOK_PREC: &str = "P0";
const BOOK_FREQ: &str = "F0";
const BOOK_LEN: u32 = 25;

const QUOTE_SUFFIXES: [(&str, &str); 5] = [("UST", "USDT"), ("UDC", "USDC"), ("USD", "USD"), ("EUR", "EUR"), ("BTC", "BTC")];

fn quote_to_bfx(quote: &str) -> &str {
    QUOTE_SUFFIXES.iter().find(|(_, human)| *human == quote).map(|(bfx, _)| *bfx).unwrap_or(quote)
}

fn human_from_bfx_code(code: &str) -> Option<Pair> {
    for (suffix, human_quote) in QUOTE_SUFFIXES {
        if let Some(base) = code.strip_suffix(suffix) {
            if !base.is_empty() {
                return Pair::new(base, human_quote).ok();
            }
        }
    }
    None
}

fn pair_to_bfx_symbol(pair: &Pair) -> String {
    format!("t{}{}", pair.base(), quote_to_bfx(pair.quote()))
}

pub struct BitfinexConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
    pair_to_symbol: RwLock<HashMap<Pair, String>>,
}

impl BitfinexConnector {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), metrics: Arc::new(ConnectorMetrics::default()), pair_to_symbol: RwLock::new(HashMap::new()) }
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }
}

async fn run_batch(batch: Vec<Pair>, symbols: HashMap<Pair, String>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken, metrics: Arc<ConnectorMetrics>) {
    run_with_reconnect(&cancel, &metrics, || {
        let batch = batch.clone();
        let symbols = symbols.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move { consume(&batch, &symbols, sink.as_ref(), &metrics).await }
    })
    .await;
}

async fn consume(batch: &[Pair], symbols: &HashMap<Pair, String>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let (ws, _) = connect_async(WS_URL).await.context("bitfinex connect")?;
    let (mut write, mut read) = ws.split();

    let mut books: HashMap<Pair, OrderBook> = HashMap::new();
    for pair in batch {
        let Some(symbol) = symbols.get(pair) else { continue };
        let sub = json!({
            "event": "subscribe",
            "channel": "book",
            "symbol": symbol,
            "prec": BOOK_PREC,
            "freq": BOOK_FREQ,
            "len": BOOK_LEN,
        });
        write.send(Message::Text(sub.to_string())).await.context("bitfinex subscribe")?;
        books.insert(pair.clone(), OrderBook::new());
    }

    let mut chan_to_pair: HashMap<i64, Pair> = HashMap::new();

    while let Some(msg) = read.next().await {
        let msg = msg.context("bitfinex ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(anyhow!("bitfinex ws closed")),
            _ => continue,
        };
        metrics.record_message();

        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            metrics.record_parse_error();
            continue;
        };

        if let Some(obj) = value.as_object() {
            if obj.get("event").and_then(Value::as_str) == Some("subscribed") && obj.get("channel").and_then(Value::as_str) == Some("book") {
                if let (Some(chan_id), Some(symbol)) = (obj.get("chanId").and_then(Value::as_i64), obj.get("symbol").and_then(Value::as_str)) {
                    if let Some(pair) = batch.iter().find(|p| symbols.get(*p).map(String::as_str) == Some(symbol)) {
                        chan_to_pair.insert(chan_id, pair.clone());
                    }
                }
            }
            continue;
        }

        let Some(arr) = value.as_array() else { continue };
        if arr.len() < 2 {
            continue;
        }
        let Some(chan_id) = arr[0].as_i64() else { continue };
        let Some(pair) = chan_to_pair.get(&chan_id) else { continue };
        let Some(book) = books.get_mut(pair) else { continue };

        if let Some(payload) = arr[1].as_array() {
            if payload.first().is_some_and(Value::is_array) {
                book.reset();
                for entry in payload {
                    apply_entry(book, entry);
                }
            } else if payload.len() == 3 {
                apply_entry(book, &arr[1]);
            } else {
                continue;
            }
        } else if arr[1].as_str() == Some("hb") {
            continue;
        } else {
            continue;
        }

        publish_best(pair, book, sink, metrics);
    }

    Err(anyhow!("bitfinex ws stream ended"))
}

fn apply_entry(book: &mut OrderBook, entry: &Value) {
    let Some(entry) = entry.as_array() else { return };
    if entry.len() < 3 {
        return;
    }
    let price = entry[0].as_f64().and_then(|f| Decimal::try_from(f).ok());
    let count = entry[1].as_i64();
    let amount = entry[2].as_f64().and_then(|f| Decimal::try_from(f).ok());
    let (Some(price), Some(count), Some(amount)) = (price, count, amount) else { return };

    let side = if amount.is_sign_positive() { Side::Bid } else { Side::Ask };
    let size = amount.abs();
    if count == 0 {
        book.apply(side, price, Decimal::ZERO, None);
    } else {
        book.apply(side, price, size, None);
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
    sink.publish(Venue::Bitfinex, pair.clone(), quote);
}

#[async_trait]
impl Connector for BitfinexConnector {
    fn venue(&self) -> Venue {
        Venue::Bitfinex
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<Vec<Vec<String>>> = async {
            let resp = self.http.get(REST_CONF).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let codes = match result {
            Ok(mut rows) if !rows.is_empty() => std::mem::take(&mut rows[0]),
            Ok(_) => {
                warn!("bitfinex discovery returned an empty conf response");
                return Vec::new();
            }
            Err(err) => {
                warn!(error = %err, "bitfinex discovery failed");
                return Vec::new();
            }
        };

        let desired_set: std::collections::HashSet<&Pair> = desired.iter().collect();
        let mut mapping = HashMap::new();
        let mut supported = Vec::new();
        for code in codes {
            let Some(human) = human_from_bfx_code(&code) else { continue };
            if desired_set.contains(&human) {
                mapping.insert(human.clone(), format!("t{code}"));
                supported.push(human);
            }
        }
        *self.pair_to_symbol.write() = mapping;
        info!(count = supported.len(), "bitfinex discovery complete");
        supported
    }

    async fn run(&self, supported: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken) {
        if supported.is_empty() {
            return;
        }

        {
            let mut mapping = self.pair_to_symbol.write();
            for pair in &supported {
                mapping.entry(pair.clone()).or_insert_with(|| pair_to_bfx_symbol(pair));
            }
        }
        let symbols = self.pair_to_symbol.read().clone();

        let batches = batch_pairs(&supported, SUB_BATCH);
        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let sink = sink.clone();
                let cancel = cancel.clone();
                let metrics = self.metrics.clone();
                let symbols = symbols.clone();
                tokio::spawn(async move {
                    run_batch(batch, symbols, sink, cancel, metrics).await;
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
    fn maps_usdt_to_ust_and_back() {
        let pair = Pair::new("ETH", "USDT").unwrap();
        assert_eq!(pair_to_bfx_symbol(&pair), "tETHUST");
        assert_eq!(human_from_bfx_code("ETHUST").unwrap().as_str(), "ETH/USDT");
    }

    #[test]
    fn unknown_quote_suffix_falls_back_to_itself() {
        assert_eq!(quote_to_bfx("XYZ"), "XYZ");
    }

    #[test]
    fn positive_amount_is_a_bid_negative_is_an_ask() {
        let mut book = OrderBook::new();
        apply_entry(&mut book, &json!([100.0, 1, 2.5]));
        apply_entry(&mut book, &json!([101.0, 1, -1.5]));
        assert_eq!(book.best(Side::Bid).unwrap().1.size, Decimal::try_from(2.5).unwrap());
        assert_eq!(book.best(Side::Ask).unwrap().1.size, Decimal::try_from(1.5).unwrap());
    }

    #[test]
    fn count_zero_removes_the_level() {
        let mut book = OrderBook::new();
        apply_entry(&mut book, &json!([100.0, 1, 2.5]));
        apply_entry(&mut book, &json!([100.0, 0, 2.5]));
        assert!(book.best(Side::Bid).is_none());
    }
}
