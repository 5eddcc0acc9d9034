//! Coinbase Exchange: `level2_batch` channel, snapshot+delta, one subscribe
//! frame per batch.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::book::{OrderBook, Side};
use crate::connectors::{batch_pairs, now_ms, run_with_reconnect, Connector, ConnectorMetrics, DISCOVERY_TIMEOUT};
use crate::pair::Pair;
use crate::quote::{Quote, QuoteSink};
use crate::venue::Venue;

const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";
const REST_PRODUCTS: &str = "https://api.exchange.coinbase.com/products";
const SUB_BATCH: usize = 60;
const CHANNEL: &str = "level2_batch";

fn venue_symbol(pair: &Pair) -> String {
    format!("{}-{}", pair.base(), pair.quote())
}

#[derive(Debug, Deserialize)]
struct Product {
    base_currency: String,
    quote_currency: String,
    status: String,
    #[serde(default)]
    trading_disabled: bool,
    #[serde(default)]
    cancel_only: bool,
    #[serde(default)]
    post_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WsFrame {
    #[serde(rename = "subscriptions")]
    Subscriptions,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "snapshot")]
    Snapshot {
        product_id: String,
        #[serde(default)]
        bids: Vec<(String, String)>,
        #[serde(default)]
        asks: Vec<(String, String)>,
    },
    #[serde(rename = "l2update")]
    L2Update {
        product_id: String,
        #[serde(default)]
        changes: Vec<(String, String, String)>,
    },
}

pub struct CoinbaseConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
}

impl CoinbaseConnector {
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
    let (ws, _) = connect_async(WS_URL).await.context("coinbase connect")?;
    let (mut write, mut read) = ws.split();

    let product_ids: Vec<&String> = symbol_of.keys().collect();
    let sub = json!({ "type": "subscribe", "channels": [{ "name": CHANNEL, "product_ids": product_ids }] });
    write.send(Message::Text(sub.to_string())).await.context("coinbase subscribe")?;

    let mut books: HashMap<Pair, OrderBook> = symbol_of.values().map(|p| (p.clone(), OrderBook::new())).collect();

    while let Some(msg) = read.next().await {
        let msg = msg.context("coinbase ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(anyhow!("coinbase ws closed")),
            _ => continue,
        };
        metrics.record_message();

        let Ok(frame) = serde_json::from_str::<WsFrame>(&text) else {
            metrics.record_parse_error();
            continue;
        };

        let pair = match &frame {
            WsFrame::Subscriptions | WsFrame::Error => continue,
            WsFrame::Snapshot { product_id, .. } | WsFrame::L2Update { product_id, .. } => {
                let Some(pair) = symbol_of.get(product_id) else { continue };
                pair.clone()
            }
        };
        let Some(book) = books.get_mut(&pair) else { continue };

        match frame {
            WsFrame::Snapshot { bids, asks, .. } => {
                book.reset();
                apply_levels(book, Side::Bid, &bids);
                apply_levels(book, Side::Ask, &asks);
            }
            WsFrame::L2Update { changes, .. } => {
                for (side, price_str, size_str) in &changes {
                    let side = if side.eq_ignore_ascii_case("buy") { Side::Bid } else { Side::Ask };
                    let (Ok(price), Ok(size)) = (price_str.parse::<Decimal>(), size_str.parse::<Decimal>()) else { continue };
                    book.apply(side, price, size, Some(size_str.clone()));
                }
            }
            _ => unreachable!(),
        }

        publish_best(&pair, book, sink, metrics);
    }

    Err(anyhow!("coinbase ws stream ended"))
}

fn apply_levels(book: &mut OrderBook, side: Side, levels: &[(String, String)]) {
    for (price_str, size_str) in levels {
        let (Ok(price), Ok(size)) = (price_str.parse::<Decimal>(), size_str.parse::<Decimal>()) else { continue };
        book.apply(side, price, size, Some(size_str.clone()));
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
    sink.publish(Venue::Coinbase, pair.clone(), quote);
}

#[async_trait]
impl Connector for CoinbaseConnector {
    fn venue(&self) -> Venue {
        Venue::Coinbase
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<Vec<Product>> = async {
            let resp = self.http.get(REST_PRODUCTS).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let products = match result {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "coinbase discovery failed");
                return Vec::new();
            }
        };

        let tradable: std::collections::HashSet<Pair> = products
            .into_iter()
            .filter(|p| p.status.eq_ignore_ascii_case("online") && !p.trading_disabled && !p.cancel_only && !p.post_only)
            .filter_map(|p| Pair::new(&p.base_currency, &p.quote_currency).ok())
            .collect();

        let supported: Vec<Pair> = desired.iter().filter(|p| tradable.contains(p)).cloned().collect();
        info!(count = supported.len(), "coinbase discovery complete");
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
    fn venue_symbol_uses_a_dash_separator() {
        let pair = Pair::new("ETH", "USDC").unwrap();
        assert_eq!(venue_symbol(&pair), "ETH-USDC");
    }

    #[test]
    fn snapshot_then_l2update_tracks_best_levels() {
        let mut book = OrderBook::new();
        apply_levels(&mut book, Side::Bid, &[("100".into(), "1".into())]);
        apply_levels(&mut book, Side::Ask, &[("101".into(), "1".into())]);
        assert_eq!(book.best(Side::Bid).unwrap().0, Decimal::from(100));

        apply_levels(&mut book, Side::Bid, &[("100".into(), "0".into())]);
        assert!(book.best(Side::Bid).is_none());
    }

    #[test]
    fn subscriptions_ack_frame_parses_and_is_ignored() {
        let frame: WsFrame = serde_json::from_str(r#"{"type":"subscriptions","channels":[]}"#).unwrap();
        matches!(frame, WsFrame::Subscriptions);
    }
}
