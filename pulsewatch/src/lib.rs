//! # PulseWatch
//! Streaming crypto market monitor core: combined-stream ingestion, a
//! ranked market state cache, multi-timeframe threshold alerting and
//! volume-tiered REST refresh scheduling.
//!
//! ## Overview
//! [`MarketMonitor`] wires four components together:
//! - [`feed::FeedClient`] maintains the WebSocket connection, replays
//!   stream subscriptions across reconnects and fans frames out to
//!   registered callbacks.
//! - [`cache::MarketStateCache`] holds the latest ticker, funding and
//!   open interest state per symbol and samples the top-gainer ranking
//!   for significant movement.
//! - [`alert::AlertEngine`] records every price update against eight
//!   fixed timeframe windows and dispatches at most one notification
//!   per cooldown key when a rule threshold is crossed.
//! - [`tier::VolumeTierScheduler`] paces REST refreshes so high-volume
//!   symbols stay fresh without exhausting the request budget on the
//!   long tail.
//!
//! External integrations plug in at trait seams: [`rest::MarketDataApi`]
//! for the venue HTTP API, [`alert::rule::AlertRuleStore`] for rule
//! persistence, [`notify::NotificationSink`] for delivery and
//! [`market::SymbolFilter`] for instrument eligibility.

/// Multi-timeframe threshold alerting: rules, windows and the engine.
pub mod alert;

/// Latest market state per symbol plus sampled top-mover rankings.
pub mod cache;

/// Component configuration with builder overrides and `PULSEWATCH_*`
/// environment variables.
pub mod config;

/// Serde helpers for string-encoded numeric wire fields.
pub mod de;

/// Error taxonomy shared across every component.
pub mod error;

/// Reconnecting WebSocket client for the venue combined stream.
pub mod feed;

/// Market data records and symbol eligibility filtering.
pub mod market;

/// Top-level monitor wiring and operational stats.
pub mod monitor;

/// Notification delivery seam and in-memory test sink.
pub mod notify;

/// Venue REST API seam backing the scheduled refresh cycle.
pub mod rest;

/// Volume-tiered refresh scheduling for REST-sourced data.
pub mod tier;

pub use self::config::MonitorConfig;
pub use self::error::MonitorError;
pub use self::monitor::{MarketMonitor, MonitorStats};
