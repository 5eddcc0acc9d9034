//! Wires configured venues to connectors, runs discovery, keeps session
//! tasks alive, and exposes a read-only snapshot plus hot reconfiguration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connectors::binance::BinanceConnector;
use crate::connectors::bitfinex::BitfinexConnector;
use crate::connectors::bybit::BybitConnector;
use crate::connectors::coinbase::CoinbaseConnector;
use crate::connectors::htx::HtxConnector;
use crate::connectors::kraken::KrakenConnector;
use crate::connectors::kucoin::KucoinConnector;
use crate::connectors::okx::OkxConnector;
use crate::connectors::Connector;
use crate::engine::{ArbitrageEngine, EngineConfig, Opportunity, StaleEntry};
use crate::pair::Pair;
use crate::quote::{QuoteSink, QuoteTable};
use crate::venue::Venue;

fn build_connector(venue: Venue) -> Arc<dyn Connector> {
    match venue {
        Venue::Binance => Arc::new(BinanceConnector::new()),
        Venue::Bybit => Arc::new(BybitConnector::new()),
        Venue::Kraken => Arc::new(KrakenConnector::new()),
        Venue::Bitfinex => Arc::new(BitfinexConnector::new()),
        Venue::Htx => Arc::new(HtxConnector::new()),
        Venue::Kucoin => Arc::new(KucoinConnector::new()),
        Venue::Okx => Arc::new(OkxConnector::new()),
        Venue::Coinbase => Arc::new(CoinbaseConnector::new()),
    }
}

/// A point-in-time read of the scanner's state, returned by `Supervisor::snapshot`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub opportunities: Vec<Opportunity>,
    pub stale: Vec<StaleEntry>,
    pub venues: Vec<Venue>,
}

/// One venue's session state: the connector, its running tasks, and the
/// pairs it was last told to carry.
struct Running {
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    supported: Vec<Pair>,
}

fn canonical_desired(desired: &[String]) -> Vec<Pair> {
    let mut pairs: Vec<Pair> = desired.iter().filter_map(|s| s.parse().ok()).collect();
    pairs.sort();
    pairs.dedup();
    pairs
}

/// Owns every connector's running session and the shared quote table.
/// `reconfigure` swaps the whole fleet atomically from the caller's
/// perspective: readers only ever see either the old or the new sessions'
/// output, never a half-torn-down mix.
pub struct Supervisor {
    quotes: Arc<QuoteTable>,
    engine: Arc<ArbitrageEngine>,
    running: Mutex<HashMap<Venue, Running>>,
    desired: Mutex<Vec<Pair>>,
    venues: Vec<Venue>,
}

impl Supervisor {
    pub fn new(venues: Vec<Venue>, engine_config: EngineConfig) -> Self {
        Self {
            quotes: Arc::new(QuoteTable::new()),
            engine: Arc::new(ArbitrageEngine::new(engine_config)),
            running: Mutex::new(HashMap::new()),
            desired: Mutex::new(Vec::new()),
            venues,
        }
    }

    pub fn quotes(&self) -> Arc<QuoteTable> {
        self.quotes.clone()
    }

    /// Build every configured venue's connector, run discovery, and start
    /// one session task per venue carrying its supported pairs.
    pub async fn start(&self, desired: &[String]) {
        let pairs = canonical_desired(desired);
        *self.desired.lock() = pairs.clone();

        let mut running = HashMap::new();
        for venue in &self.venues {
            let connector = build_connector(*venue);
            let supported = connector.discover(&pairs).await;
            info!(%venue, count = supported.len(), "venue discovery complete");

            let cancel = CancellationToken::new();
            let handle = spawn_session(connector.clone(), supported.clone(), self.quotes.clone(), cancel.clone());
            running.insert(*venue, Running { connector, cancel, handle, supported });
        }
        *self.running.lock() = running;
    }

    /// Per-venue set of pairs this run is actually carrying, as discovered.
    pub fn supported(&self, venue: Venue) -> Vec<Pair> {
        self.running.lock().get(&venue).map(|r| r.supported.clone()).unwrap_or_default()
    }

    pub fn snapshot(&self, now_ms: i64) -> Snapshot {
        Snapshot {
            opportunities: self.engine.compute(&self.quotes, now_ms),
            stale: self.engine.list_stale(&self.quotes, now_ms),
            venues: self.venues.clone(),
        }
    }

    /// Cancel every running session, rediscover against `new_desired`, and
    /// restart. A no-op if the canonical pair set is unchanged.
    pub async fn reconfigure(&self, new_desired: &[String]) {
        let new_pairs = canonical_desired(new_desired);
        if new_pairs == *self.desired.lock() {
            return;
        }

        let old = std::mem::take(&mut *self.running.lock());
        for (_, session) in old {
            session.cancel.cancel();
            let _ = session.handle.await;
        }

        self.start(new_desired).await;
    }

    /// Cancel every running session and wait for them to finish.
    pub async fn shutdown(&self) {
        let sessions = std::mem::take(&mut *self.running.lock());
        for (_, session) in sessions {
            session.cancel.cancel();
            let _ = session.handle.await;
        }
    }
}

fn spawn_session(connector: Arc<dyn Connector>, supported: Vec<Pair>, quotes: Arc<QuoteTable>, cancel: CancellationToken) -> JoinHandle<()> {
    let sink: Arc<dyn QuoteSink> = quotes;
    tokio::spawn(async move {
        connector.run(supported, sink, cancel).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_desired_sorts_and_dedups() {
        let pairs = canonical_desired(&["ETH/USDT".into(), "BTC/USDT".into(), "eth/usdt".into()]);
        assert_eq!(pairs, vec![Pair::new("BTC", "USDT").unwrap(), Pair::new("ETH", "USDT").unwrap()]);
    }

    #[test]
    fn unparsable_desired_pairs_are_dropped() {
        let pairs = canonical_desired(&["BTCUSDT".into(), "BTC/USDT".into()]);
        assert_eq!(pairs, vec![Pair::new("BTC", "USDT").unwrap()]);
    }

    #[tokio::test]
    async fn snapshot_is_empty_before_any_session_publishes() {
        let sup = Supervisor::new(vec![], EngineConfig { thresh_enter_pct: 0.4, thresh_exit_pct: 0.3, max_profit_pct: 10.0, long_secs: 60.0, stale_secs: 30.0 });
        sup.start(&["BTC/USDT".into()]).await;
        let snap = sup.snapshot(0);
        assert!(snap.opportunities.is_empty());
        assert!(snap.stale.is_empty());
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn reconfigure_is_a_no_op_for_an_unchanged_pair_set() {
        let sup = Supervisor::new(vec![], EngineConfig { thresh_enter_pct: 0.4, thresh_exit_pct: 0.3, max_profit_pct: 10.0, long_secs: 60.0, stale_secs: 30.0 });
        sup.start(&["BTC/USDT".into()]).await;
        sup.reconfigure(&["btc/usdt".into()]).await;
        assert_eq!(sup.supported(Venue::Binance), Vec::<Pair>::new());
        sup.shutdown().await;
    }
}
