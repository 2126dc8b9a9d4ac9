//! Core market data records and the validation boundary that produces them.
//!
//! All wire payloads (streamed or REST) are converted into these strictly
//! typed records before touching any component state. Records failing
//! validation are dropped by the caller with a logged reason rather than
//! flowing downstream partially formed.

use crate::error::MonitorError;
use chrono::{DateTime, Utc};
use fnv::FnvHashSet;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Interned market symbol, eg/ "BTCUSDT".
pub type Symbol = SmolStr;

/// Latest 24h rolling statistics for one symbol.
///
/// Ephemeral: replaced wholesale on every update, never persisted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TickerSnapshot {
    /// Market symbol the statistics belong to
    pub symbol: Symbol,
    /// Last traded price
    pub price: f64,
    /// Absolute price change over the trailing 24h
    pub price_change: f64,
    /// Percent price change over the trailing 24h
    pub price_change_percent: f64,
    /// 24h quote volume (the unit tier bands are defined in)
    pub volume: f64,
    /// Exchange event time
    pub timestamp: DateTime<Utc>,
}

impl TickerSnapshot {
    /// Validate raw field values into a well-formed snapshot.
    ///
    /// Rejects empty symbols, non-finite or non-positive prices, non-finite
    /// change fields and negative volume.
    pub fn validated(
        symbol: &str,
        price: f64,
        price_change: f64,
        price_change_percent: f64,
        volume: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, MonitorError> {
        if symbol.trim().is_empty() {
            return Err(MonitorError::Validation("symbol: empty".to_string()));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(MonitorError::Validation(format!(
                "{symbol} price: {price} not a positive finite number"
            )));
        }
        if !price_change.is_finite() || !price_change_percent.is_finite() {
            return Err(MonitorError::Validation(format!(
                "{symbol} change fields: non-finite"
            )));
        }
        if !volume.is_finite() || volume < 0.0 {
            return Err(MonitorError::Validation(format!(
                "{symbol} volume: {volume} negative or non-finite"
            )));
        }

        Ok(Self {
            symbol: SmolStr::new(symbol),
            price,
            price_change,
            price_change_percent,
            volume,
            timestamp,
        })
    }
}

/// Single observed price point appended to every timeframe window.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PriceSnapshot {
    /// Observed price
    pub price: f64,
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// 24h quote volume at observation time
    pub volume24h: f64,
}

/// Latest funding rate observed for one symbol via REST.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FundingSnapshot {
    /// Market symbol
    pub symbol: Symbol,
    /// Current funding rate as a fraction, eg/ 0.0001 = 1bps
    pub rate: f64,
    /// Mark index price at observation time, when provided
    pub index_price: Option<f64>,
    /// Next funding settlement time, when provided
    pub next_funding_time: Option<DateTime<Utc>>,
    /// Observation time
    pub timestamp: DateTime<Utc>,
}

/// Open interest statistics point for one symbol via REST.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OpenInterestStat {
    /// Market symbol
    pub symbol: Symbol,
    /// Outstanding contracts in base units
    pub open_interest: f64,
    /// Notional value in quote units, when provided
    pub notional: Option<f64>,
    /// Snapshot time
    pub timestamp: DateTime<Utc>,
}

/// Eligibility filter applied to every ingested symbol.
///
/// Implementations answer from in-memory state; classification sources are an
/// external concern.
pub trait SymbolFilter: Send + Sync {
    fn is_eligible(&self, symbol: &str) -> bool;
}

/// Allow/deny-list filter backed by static sets.
///
/// An empty allow list admits every symbol not explicitly denied.
#[derive(Debug, Clone, Default)]
pub struct StaticSymbolFilter {
    allowed: Option<FnvHashSet<Symbol>>,
    denied: FnvHashSet<Symbol>,
}

impl StaticSymbolFilter {
    /// Admit every symbol.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Admit only the given symbols.
    pub fn allow_only<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: Some(
                symbols
                    .into_iter()
                    .map(|symbol| SmolStr::new(symbol.as_ref()))
                    .collect(),
            ),
            denied: FnvHashSet::default(),
        }
    }

    /// Deny the given symbols, admitting all others.
    pub fn deny<I, S>(symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: None,
            denied: symbols
                .into_iter()
                .map(|symbol| SmolStr::new(symbol.as_ref()))
                .collect(),
        }
    }
}

impl SymbolFilter for StaticSymbolFilter {
    fn is_eligible(&self, symbol: &str) -> bool {
        if self.denied.contains(symbol) {
            return false;
        }
        match &self.allowed {
            Some(allowed) => allowed.contains(symbol),
            None => true,
        }
    }
}
