//! arbscan: thin binary wiring `Config::from_env` into a `Supervisor` and
//! printing a periodic snapshot of opportunities and stale quotes.

use std::sync::Arc;
use std::time::Duration;

use arbscan_core::engine::EngineConfig;
use arbscan_core::format;
use arbscan_core::{Config, Supervisor};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(2);

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "arbscan_core=info,arbscan=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env();
    info!(
        venues = ?config.venues,
        pairs = ?config.desired_pairs,
        thresh_enter_pct = config.thresh_enter_pct,
        thresh_exit_pct = config.thresh_exit_pct,
        "starting arbscan"
    );

    let engine_config = EngineConfig {
        thresh_enter_pct: config.thresh_enter_pct,
        thresh_exit_pct: config.thresh_exit_pct,
        max_profit_pct: config.max_profit_pct,
        long_secs: config.long_secs,
        stale_secs: config.stale_secs,
    };

    let supervisor = Arc::new(Supervisor::new(config.venues.clone(), engine_config));
    supervisor.start(&config.desired_pairs).await;

    let mut tick = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tick.tick().await;
        print_snapshot(&supervisor);
    }
}

fn print_snapshot(supervisor: &Supervisor) {
    let snapshot = supervisor.snapshot(now_ms());

    println!("--- opportunities ({}) ---", snapshot.opportunities.len());
    for opp in &snapshot.opportunities {
        println!(
            "{} buy {} @ {} sell {} @ {} profit {}% qty {} long={}",
            opp.pair,
            opp.buy_venue,
            format::format(opp.buy_price_str.as_deref(), opp.buy_price.to_string().parse().ok()),
            opp.sell_venue,
            format::format(opp.sell_price_str.as_deref(), opp.sell_price.to_string().parse().ok()),
            format::format(None, Some(opp.profit_pct)),
            format::format(None, opp.exec_qty.to_string().parse().ok()),
            opp.long
        );
    }

    if !snapshot.stale.is_empty() {
        println!("--- stale ({}) ---", snapshot.stale.len());
        for entry in &snapshot.stale {
            println!("{} {} age={:.1}s", entry.venue, entry.pair, entry.age_sec);
        }
    }
}
