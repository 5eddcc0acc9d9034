//! arbscan-core: cross-venue order-book scanning and arbitrage detection.
//!
//! Exposes the building blocks a binary or test harness wires together:
//! venue/pair identifiers, the quote table, the order-book level store, the
//! numeric formatter, the hysteresis-gated arbitrage engine, the connector
//! framework, run configuration, and the supervisor that ties them together.

pub mod book;
pub mod config;
pub mod connectors;
pub mod engine;
pub mod format;
pub mod hysteresis;
pub mod pair;
pub mod quote;
pub mod supervisor;
pub mod venue;

pub use config::Config;
pub use engine::{ArbitrageEngine, EngineConfig, Opportunity, StaleEntry};
pub use pair::{Pair, PairParseError};
pub use quote::{Quote, QuoteSink, QuoteTable};
pub use supervisor::{Snapshot, Supervisor};
pub use venue::Venue;
