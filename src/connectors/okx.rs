//! OKX spot: `books5` channel, full-snapshot style, a single subscribe frame
//! listing every instrument in the batch.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
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

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_INSTRUMENTS: &str = "https://www.okx.com/api/v5/public/instruments?instType=SPOT";
const SUB_BATCH: usize = 75;
const BOOK_CHANNEL: &str = "books5";

fn pair_to_inst_id(pair: &Pair) -> String {
    format!("{}-{}", pair.base(), pair.quote())
}

fn inst_id_to_pair(inst_id: &str) -> Option<Pair> {
    let (base, quote) = inst_id.split_once('-')?;
    Pair::new(base, quote).ok()
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    data: Vec<Instrument>,
}

#[derive(Debug, Deserialize)]
struct Instrument {
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Debug, Deserialize)]
struct DataFrame {
    arg: ArgField,
    data: Vec<BookLevels>,
}

#[derive(Debug, Deserialize)]
struct ArgField {
    #[serde(rename = "instId")]
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct BookLevels {
    #[serde(default)]
    bids: Vec<(String, String, String, String)>,
    #[serde(default)]
    asks: Vec<(String, String, String, String)>,
}

pub struct OkxConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
    pair_to_inst: RwLock<HashMap<Pair, String>>,
}

impl OkxConnector {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), metrics: Arc::new(ConnectorMetrics::default()), pair_to_inst: RwLock::new(HashMap::new()) }
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }
}

async fn run_batch(batch: Vec<Pair>, insts: HashMap<Pair, String>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken, metrics: Arc<ConnectorMetrics>) {
    run_with_reconnect(&cancel, &metrics, || {
        let batch = batch.clone();
        let insts = insts.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        async move { consume(&batch, &insts, sink.as_ref(), &metrics).await }
    })
    .await;
}

async fn consume(batch: &[Pair], insts: &HashMap<Pair, String>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let (ws, _) = connect_async(WS_URL).await.context("okx connect")?;
    let (mut write, mut read) = ws.split();

    let args: Vec<_> = batch
        .iter()
        .filter_map(|p| insts.get(p))
        .map(|inst| json!({ "channel": BOOK_CHANNEL, "instId": inst }))
        .collect();
    if args.is_empty() {
        return Ok(());
    }
    write.send(Message::Text(json!({ "op": "subscribe", "args": args }).to_string())).await.context("okx subscribe")?;

    while let Some(msg) = read.next().await {
        let msg = msg.context("okx ws read")?;
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(anyhow!("okx ws closed")),
            _ => continue,
        };
        metrics.record_message();

        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                metrics.record_parse_error();
                continue;
            }
        };
        if value.get("event").is_some() {
            continue; // subscribe ack / error event
        }

        let Ok(frame) = serde_json::from_value::<DataFrame>(value) else { continue };
        let Some(inst_id) = frame.arg.inst_id else { continue };
        let Some(pair) = inst_id_to_pair(&inst_id) else { continue };
        if !batch.contains(&pair) {
            continue;
        }
        let Some(levels) = frame.data.last() else { continue };

        publish_top_of_book(&pair, levels, sink, metrics);
    }

    Err(anyhow!("okx ws stream ended"))
}

fn publish_top_of_book(pair: &Pair, levels: &BookLevels, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) {
    let best_bid = levels.bids.first();
    let best_ask = levels.asks.first();
    if best_bid.is_none() && best_ask.is_none() {
        return;
    }

    let ts = now_ms();
    let quote = Quote {
        bid: best_bid.and_then(|(p, ..)| p.parse::<Decimal>().ok()),
        bid_sz: best_bid.and_then(|(_, s, ..)| s.parse::<Decimal>().ok()),
        bid_str: best_bid.map(|(p, ..)| p.clone()),
        ask: best_ask.and_then(|(p, ..)| p.parse::<Decimal>().ok()),
        ask_sz: best_ask.and_then(|(_, s, ..)| s.parse::<Decimal>().ok()),
        ask_str: best_ask.map(|(p, ..)| p.clone()),
        ts_ms: ts,
    };
    metrics.record_update(ts);
    sink.publish(Venue::Okx, pair.clone(), quote);
}

#[async_trait]
impl Connector for OkxConnector {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    async fn discover(&self, desired: &[Pair]) -> Vec<Pair> {
        let result: Result<InstrumentsResponse> = async {
            let resp = self.http.get(REST_INSTRUMENTS).timeout(DISCOVERY_TIMEOUT).send().await?;
            Ok(resp.json().await?)
        }
        .await;

        let instruments = match result {
            Ok(r) => r.data,
            Err(err) => {
                warn!(error = %err, "okx discovery failed");
                return Vec::new();
            }
        };

        let desired_set: std::collections::HashSet<&Pair> = desired.iter().collect();
        let mut mapping = HashMap::new();
        let mut supported = Vec::new();
        for inst in instruments {
            let Some(human) = inst_id_to_pair(&inst.inst_id) else { continue };
            if desired_set.contains(&human) {
                mapping.insert(human.clone(), inst.inst_id);
                supported.push(human);
            }
        }
        *self.pair_to_inst.write() = mapping;
        info!(count = supported.len(), "okx discovery complete");
        supported
    }

    async fn run(&self, supported: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken) {
        if supported.is_empty() {
            return;
        }

        {
            let mut mapping = self.pair_to_inst.write();
            for pair in &supported {
                mapping.entry(pair.clone()).or_insert_with(|| pair_to_inst_id(pair));
            }
        }
        let insts = self.pair_to_inst.read().clone();

        let batches = batch_pairs(&supported, SUB_BATCH);
        let handles: Vec<_> = batches
            .into_iter()
            .map(|batch| {
                let sink = sink.clone();
                let cancel = cancel.clone();
                let metrics = self.metrics.clone();
                let insts = insts.clone();
                tokio::spawn(async move {
                    run_batch(batch, insts, sink, cancel, metrics).await;
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
    fn inst_id_round_trips() {
        let pair = Pair::new("BTC", "USDT").unwrap();
        assert_eq!(pair_to_inst_id(&pair), "BTC-USDT");
        assert_eq!(inst_id_to_pair("BTC-USDT").unwrap(), pair);
    }

    #[test]
    fn takes_the_last_snapshot_in_the_data_array() {
        let json = r#"{"arg":{"instId":"BTC-USDT"},"data":[
            {"bids":[["98","1","0","1"]],"asks":[["99","1","0","1"]]},
            {"bids":[["100","2","0","1"]],"asks":[["101","2","0","1"]]}
        ]}"#;
        let frame: DataFrame = serde_json::from_str(json).unwrap();
        let latest = frame.data.last().unwrap();
        assert_eq!(latest.bids[0].0, "100");
    }

    #[test]
    fn control_events_do_not_parse_as_data_frames() {
        let value: serde_json::Value = serde_json::from_str(r#"{"event":"subscribe","arg":{"channel":"books5"}}"#).unwrap();
        assert!(value.get("event").is_some());
    }
}
