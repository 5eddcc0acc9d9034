//! KuCoin spot: token-bootstrap HTTP endpoint before the WS connect,
//! `/spotMarket/level2Depth5:{symbol}` topic, mandatory client-driven ping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

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

const REST_SYMBOLS: &str = "https://api.kucoin.com/api/v2/symbols";
const REST_BULLET: &str = "https://api.kucoin.com/api/v1/bullet-public";
const SUB_BATCH: usize = 50;
const MIN_PING_INTERVAL: Duration = Duration::from_secs(5);

fn human_to_kucoin(pair: &Pair) -> String {
    format!("{}-{}", pair.base(), pair.quote())
}

fn kucoin_to_human(symbol: &str) -> Option<Pair> {
    let (base, quote) = symbol.split_once('-')?;
    Pair::new(base, quote).ok()
}

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    data: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    #[serde(rename = "enableTrading")]
    enable_trading: bool,
    #[serde(rename = "baseCurrency")]
    base_currency: String,
    #[serde(rename = "quoteCurrency")]
    quote_currency: String,
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct BulletResponse {
    data: BulletData,
}

#[derive(Debug, Deserialize)]
struct BulletData {
    token: String,
    #[serde(rename = "instanceServers")]
    instance_servers: Vec<InstanceServer>,
}

#[derive(Debug, Deserialize)]
struct InstanceServer {
    endpoint: String,
    #[serde(rename = "pingInterval")]
    ping_interval: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Welcome,
    Pong,
    Ack,
    Error,
    #[serde(rename = "message")]
    Message { topic: String, data: Level2Depth },
}

#[derive(Debug, Deserialize, Default)]
struct Level2Depth {
    #[serde(default)]
    bids: Vec<(String, String)>,
    #[serde(default)]
    asks: Vec<(String, String)>,
}

pub struct KucoinConnector {
    http: reqwest::Client,
    metrics: Arc<ConnectorMetrics>,
    pair_to_symbol: RwLock<HashMap<Pair, String>>,
}

impl KucoinConnector {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), metrics: Arc::new(ConnectorMetrics::default()), pair_to_symbol: RwLock::new(HashMap::new()) }
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }
}

async fn ws_endpoint(http: &reqwest::Client) -> Result<(String, String, Duration)> {
    let resp: BulletResponse = http.post(REST_BULLET).timeout(DISCOVERY_TIMEOUT).send().await?.json().await?;
    let server = resp.data.instance_servers.into_iter().next().context("kucoin bullet response had no servers")?;
    Ok((server.endpoint, resp.data.token, Duration::from_millis(server.ping_interval)))
}

async fn run_batch(batch: Vec<Pair>, symbols: HashMap<Pair, String>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken, metrics: Arc<ConnectorMetrics>, http: reqwest::Client) {
    run_with_reconnect(&cancel, &metrics, || {
        let batch = batch.clone();
        let symbols = symbols.clone();
        let sink = sink.clone();
        let metrics = metrics.clone();
        let http = http.clone();
        async move { consume(&http, &batch, &symbols, sink.as_ref(), &metrics).await }
    })
    .await;
}

async fn consume(http: &reqwest::Client, batch: &[Pair], symbols: &HashMap<Pair, String>, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) -> Result<()> {
    let (endpoint, token, server_ping_interval) = ws_endpoint(http).await.context("kucoin bullet bootstrap")?;
    let connect_id = uuid::Uuid::new_v4();
    let url = format!("{endpoint}?token={token}&connectId={connect_id}");

    let (ws, _) = connect_async(&url).await.context("kucoin connect")?;
    let (mut write, mut read) = ws.split();

    for pair in batch {
        let Some(symbol) = symbols.get(pair) else { continue };
        let sub = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": "subscribe",
            "topic": format!("/spotMarket/level2Depth5:{symbol}"),
            "privateChannel": false,
            "response": true,
        });
        write.send(Message::Text(sub.to_string())).await.context("kucoin subscribe")?;
    }

    let ping_interval = server_ping_interval.checked_sub(Duration::from_secs(2)).unwrap_or(MIN_PING_INTERVAL).max(MIN_PING_INTERVAL);
    let mut ping_timer = tokio::time::interval(ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ping_timer.tick() => {
                let ping = json!({ "id": uuid::Uuid::new_v4().to_string(), "type": "ping" });
                write.send(Message::Text(ping.to_string())).await.context("kucoin client ping")?;
            }
            msg = read.next() => {
                let Some(msg) = msg else { return Err(anyhow!("kucoin ws stream ended")) };
                let msg = msg.context("kucoin ws read")?;
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => return Err(anyhow!("kucoin ws closed")),
                    _ => continue,
                };
                metrics.record_message();

                let Ok(frame) = serde_json::from_str::<ControlFrame>(&text) else {
                    metrics.record_parse_error();
                    continue;
                };

                let ControlFrame::Message { topic, data } = frame else { continue };
                let Some(symbol) = topic.strip_prefix("/spotMarket/level2Depth5:") else { continue };
                let Some(pair) = kucoin_to_human(symbol) else { continue };
                if !batch.contains(&pair) {
                    continue;
                }

                publish_top_of_book(&pair, &data, sink, metrics);
            }
        }
    }
}

fn publish_top_of_book(pair: &Pair, data: &Level2Depth, sink: &dyn QuoteSink, metrics: &ConnectorMetrics) {
    let best_bid = data.bids.first();
    let best_ask = data.asks.first();
    if best_bid.is_none() && best_ask.is_none() {
        return;
    }

    let ts = now_ms();
    let quote = Quote {
        bid: best_bid.and_then(|(p, _)| p.parse::<Decimal>().ok()),
        bid_sz: best_bid.and_then(|(_, s)| s.parse::<Decimal>().ok()),
        bid_str: best_bid.map(|(p, _)| p.clone()),
        ask: best_ask.and_then(|(p, _)| p.parse::<Decimal>().ok()),
        ask_sz: best_ask.and_then(|(_, s)| s.parse::<Decimal>().ok()),
        ask_str: best_ask.map(|(p, _)| p.clone()),
        ts_ms: ts,
    };
    metrics.record_update(ts);
    sink.publish(Venue::Kucoin, pair.clone(), quote);
}

#[async_trait]
impl Connector for KucoinConnector {
    fn venue(&self) -> Venue {
        Venue::Kucoin
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
                warn!(error = %err, "kucoin discovery failed");
                return Vec::new();
            }
        };

        let desired_set: std::collections::HashSet<&Pair> = desired.iter().collect();
        let mut mapping = HashMap::new();
        let mut supported = Vec::new();
        for info in symbols {
            if !info.enable_trading {
                continue;
            }
            let Ok(human) = Pair::new(&info.base_currency, &info.quote_currency) else { continue };
            if desired_set.contains(&human) {
                mapping.insert(human.clone(), info.symbol);
                supported.push(human);
            }
        }
        *self.pair_to_symbol.write() = mapping;
        info!(count = supported.len(), "kucoin discovery complete");
        supported
    }

    async fn run(&self, supported: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken) {
        if supported.is_empty() {
            return;
        }

        {
            let mut mapping = self.pair_to_symbol.write();
            for pair in &supported {
                mapping.entry(pair.clone()).or_insert_with(|| human_to_kucoin(pair));
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
                let http = self.http.clone();
                tokio::spawn(async move {
                    run_batch(batch, symbols, sink, cancel, metrics, http).await;
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
    fn symbol_mapping_round_trips() {
        let pair = Pair::new("BTC", "USDT").unwrap();
        assert_eq!(human_to_kucoin(&pair), "BTC-USDT");
        assert_eq!(kucoin_to_human("BTC-USDT").unwrap(), pair);
    }

    #[test]
    fn malformed_symbol_does_not_map() {
        assert!(kucoin_to_human("BTCUSDT").is_none());
    }

    #[test]
    fn control_frame_message_variant_parses() {
        let json = r#"{"type":"message","topic":"/spotMarket/level2Depth5:BTC-USDT","data":{"bids":[["100","1"]],"asks":[["101","2"]]}}"#;
        let frame: ControlFrame = serde_json::from_str(json).unwrap();
        let ControlFrame::Message { topic, data } = frame else { panic!("expected message variant") };
        assert_eq!(topic, "/spotMarket/level2Depth5:BTC-USDT");
        assert_eq!(data.bids[0].0, "100");
    }

    #[test]
    fn ping_interval_never_drops_below_the_floor() {
        let tiny = Duration::from_millis(1000).checked_sub(Duration::from_secs(2)).unwrap_or(MIN_PING_INTERVAL).max(MIN_PING_INTERVAL);
        assert_eq!(tiny, MIN_PING_INTERVAL);
    }
}
