//! Bybit spot: `orderbook.{depth}.{symbol}` topics, snapshot+delta, one
//! subscribe frame per batch, app-level ping/pong.

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
use tracing::{debug, info, warn};

use crate::book::{OrderBook, Side};
use crate::connectors::{batch_pairs, now_ms, run_with_reconnect, Connector, ConnectorMetrics, DISCOVERY_TIMEOUT};
use crate::pair::Pair;
use crate::quote::{Quote, QuoteSink};
use crate::venue::Venue;

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const REST_INSTR: &str = "https://api.bybit.com/v5/market/instruments-info?category=spot";
const SUB_BATCH: usize = 10;
const DEPTH: u32 = 1;

fn venue_symbol(pair: &Pair) -> String {
    format!("{}{}", pair.base(), pair.quote())
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    result: InstrumentsResult,
}

#[derive(Debug, Deserialize, Default)]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "baseCoin")]
    base_coin: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WsFrame {
    Ping {
        op: PingOp,
        #[serde(default)]
        req_id: Option<String>,
    },
    Data {
        topic: String,
        #[serde(rename = "type")]
        kind: String,
        data: DepthPayload,
    },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
enum PingOp {
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Deserialize, Default)]
struct DepthPayload {
    #[serde(default, rename = "b")]
    bids: Vec<(String, String)>,
    #[serde(default, rename = "a")]
    asks: Vec<(String, String)>,
}

pub struct BybitConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
}

impl BybitConnector {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), metrics: Arc::new(ConnectorMetrics::default()) }
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }
}

async fn run_batch(batch: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken, metrics: Arc<ConnectorMetrics>) {
    let symbol_of: HashMap<String, Pair> = batch.iter().map(|p| (venue_symbol(p), p.clone())).collect();
    let args: Vec<String> = batch.iter().map(|p| format!("orderbook.{}.{}", DEPTH, venue_symbol(p))).collect();

    run_with_reconnect(&cancel, &metrics, || {
        let args = args.clone();
        let symbol_of = symbol_of.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move { consume(&args, &symbol_of, sink.as_ref(), &metrics).await }
    })
    .await;
}

async fn consume(args: &[String], symbol_of: &HashMap<String, Pair>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let (ws, _) = connect_async(WS_URL).await.context("bybit connect")?;
    let (mut write, mut read) = ws.split();

    write.send(Message::Text(json!({ "op": "subscribe", "args": args }).to_string())).await.context("bybit subscribe")?;

    let mut books: HashMap<Pair, OrderBook> = symbol_of.values().map(|p| (p.clone(), OrderBook::new())).collect();

    while let Some(msg) = read.next().await {
        let msg = msg.context("bybit ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Ping(payload) => {
                write.send(Message::Pong(payload)).await.ok();
                continue;
            }
            Message::Close(_) => return Err(anyhow!("bybit ws closed")),
            _ => continue,
        };
        metrics.record_message();

        let Ok(frame) = serde_json::from_str::<WsFrame>(&text) else {
            metrics.record_parse_error();
            continue;
        };

        match frame {
            WsFrame::Ping { op: PingOp::Ping, req_id } => {
                write.send(Message::Text(json!({ "op": "pong", "req_id": req_id }).to_string())).await.ok();
            }
            WsFrame::Data { topic, kind, data } => {
                let Some(symbol) = topic.rsplit('.').next() else { continue };
                let Some(pair) = symbol_of.get(symbol) else { continue };
                let Some(book) = books.get_mut(pair) else { continue };

                if kind == "snapshot" {
                    book.reset();
                }
                apply_levels(book, Side::Bid, &data.bids);
                apply_levels(book, Side::Ask, &data.asks);

                publish_best(pair, book, sink, metrics);
            }
            WsFrame::Other(_) => {}
        }
    }

    Err(anyhow!("bybit ws stream ended"))
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
    sink.publish(Venue::Bybit, pair.clone(), quote);
}

#[async_trait]
impl Connector for BybitConnector {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<InstrumentsResponse> = async {
            let resp = self.http.get(REST_INSTR).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let instruments = match result {
            Ok(r) => r.result.list,
            Err(err) => {
                warn!(error = %err, "bybit discovery failed");
                return Vec::new();
            }
        };

        let tradable: std::collections::HashSet<Pair> = instruments
            .into_iter()
            .filter(|it| it.status.eq_ignore_ascii_case("trading"))
            .filter_map(|it| Pair::new(&it.base_coin, &it.quote_coin).ok())
            .collect();

        let supported: Vec<Pair> = desired.iter().filter(|p| tradable.contains(p)).cloned().collect();
        info!(count = supported.len(), "bybit discovery complete");
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
        debug!("bybit run exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn venue_symbol_strips_the_separator() {
        let pair = Pair::from_str("BTC/USDT").unwrap();
        assert_eq!(venue_symbol(&pair), "BTCUSDT");
    }

    #[test]
    fn snapshot_frame_replaces_prior_book_state() {
        let mut book = OrderBook::new();
        apply_levels(&mut book, Side::Bid, &[("99".into(), "1".into())]);
        book.reset();
        apply_levels(&mut book, Side::Bid, &[("98".into(), "1".into())]);
        assert_eq!(book.best(Side::Bid).unwrap().0, Decimal::from(98));
    }

    #[test]
    fn zero_size_delta_removes_the_level() {
        let mut book = OrderBook::new();
        apply_levels(&mut book, Side::Ask, &[("100".into(), "1".into())]);
        apply_levels(&mut book, Side::Ask, &[("100".into(), "0".into())]);
        assert!(book.best(Side::Ask).is_none());
    }

    #[test]
    fn parses_ping_frame() {
        let frame: WsFrame = serde_json::from_str(r#"{"op":"ping","req_id":"abc"}"#).unwrap();
        matches!(frame, WsFrame::Ping { .. });
    }
}
