//! The venue connector framework: one `Connector` implementation per
//! exchange, sharing batching and reconnect helpers from this module.

pub mod binance;
pub mod bitfinex;
pub mod bybit;
pub mod coinbase;
pub mod htx;
pub mod kraken;
pub mod kucoin;
pub mod okx;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::pair::Pair;
use crate::quote::QuoteSink;
use crate::venue::Venue;

/// Fixed reconnect delay after any I/O, parse, or protocol error.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Bounded timeout for one-shot discovery HTTP calls.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-connector counters, additive to the data model: messages received,
/// parse errors, reconnect count, and the time of the last accepted update.
/// Exposed read-only through the supervisor snapshot.
#[derive(Debug, Default)]
pub struct ConnectorMetrics {
    pub messages_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub last_update_ms: AtomicI64,
}

impl ConnectorMetrics {
    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self, now_ms: i64) {
        self.last_update_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectorMetricsSnapshot {
        ConnectorMetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_update_ms: self.last_update_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorMetricsSnapshot {
    pub messages_received: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    pub last_update_ms: i64,
}

/// One venue's capability set: discover tradable pairs, then run sessions
/// carrying them until cancelled. Shared behavior (batching, reconnect,
/// best-level derivation) lives in the free functions below, not in a base
/// type — each venue struct only implements the parts that actually differ.
#[async_trait]
pub trait Connector: Send + Sync {
    fn venue(&self) -> Venue;

    /// One-shot HTTP call against the venue's public instruments endpoint.
    /// Returns the intersection of `desired` with the venue's currently
    /// tradable pairs. Never returns an error to the caller: failures are
    /// logged and an empty set is returned.
    async fn discover(&self, desired: &[Pair]) -> Vec<Pair>;

    /// Start as many websocket sessions as needed to carry `supported`,
    /// each handling at most this connector's `SUB_BATCH` pairs. Returns
    /// only when `cancel` is triggered.
    async fn run(&self, supported: Vec<Pair>, sink: Arc<dyn QuoteSink>, cancel: CancellationToken);
}

/// Split `pairs` into chunks of at most `batch_size`, in their original
/// order, for one websocket session each.
pub fn batch_pairs(pairs: &[Pair], batch_size: usize) -> Vec<Vec<Pair>> {
    if batch_size == 0 {
        return vec![pairs.to_vec()];
    }
    pairs.chunks(batch_size).map(|c| c.to_vec()).collect()
}

/// Run `session` in a loop, sleeping `RECONNECT_BACKOFF` and recording a
/// reconnect after any error, until `cancel` fires. `session` returning
/// `Ok(())` is itself treated as a disconnect worth reconnecting from; the
/// only way out of the loop is cancellation.
pub async fn run_with_reconnect<F, Fut>(cancel: &CancellationToken, metrics: &ConnectorMetrics, mut session: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = session() => result,
        };

        if let Err(err) = outcome {
            tracing::warn!(error = %err, "connector session ended, reconnecting");
        }
        metrics.record_reconnect();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pairs(n: usize) -> Vec<Pair> {
        (0..n).map(|i| Pair::from_str(&format!("C{i}/USDT")).unwrap()).collect()
    }

    #[test]
    fn batches_respect_the_configured_size() {
        let batches = batch_pairs(&pairs(25), 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 10);
        assert_eq!(batches[2].len(), 5);
    }

    #[test]
    fn batching_preserves_order() {
        let input = pairs(5);
        let batches = batch_pairs(&input, 2);
        let flattened: Vec<Pair> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, input);
    }

    #[test]
    fn empty_input_produces_no_batches() {
        assert!(batch_pairs(&[], 10).is_empty());
    }

    #[test]
    fn metrics_snapshot_reflects_recorded_events() {
        let metrics = ConnectorMetrics::default();
        metrics.record_message();
        metrics.record_message();
        metrics.record_parse_error();
        metrics.record_reconnect();
        metrics.record_update(1_000);

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.reconnects, 1);
        assert_eq!(snap.last_update_ms, 1_000);
    }

    #[tokio::test]
    async fn reconnect_loop_stops_immediately_once_cancelled() {
        let cancel = CancellationToken::new();
        let metrics = ConnectorMetrics::default();
        cancel.cancel();

        run_with_reconnect(&cancel, &metrics, || async { Ok(()) }).await;
        assert_eq!(metrics.snapshot().reconnects, 0);
    }
}
