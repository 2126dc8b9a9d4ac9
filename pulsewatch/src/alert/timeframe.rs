use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::MonitorError,
    market::{PriceSnapshot, Symbol},
};

/// Fixed timeframes every price update is recorded against.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "24h")]
    Hour24,
    #[serde(rename = "3d")]
    Day3,
}

impl Timeframe {
    /// Every timeframe, shortest first.
    pub const ALL: [Timeframe; 8] = [
        Timeframe::Min1,
        Timeframe::Min5,
        Timeframe::Min15,
        Timeframe::Min30,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Hour24,
        Timeframe::Day3,
    ];

    /// Window duration covered by this timeframe.
    pub fn duration(&self) -> ChronoDuration {
        match self {
            Timeframe::Min1 => ChronoDuration::minutes(1),
            Timeframe::Min5 => ChronoDuration::minutes(5),
            Timeframe::Min15 => ChronoDuration::minutes(15),
            Timeframe::Min30 => ChronoDuration::minutes(30),
            Timeframe::Hour1 => ChronoDuration::hours(1),
            Timeframe::Hour4 => ChronoDuration::hours(4),
            Timeframe::Hour24 => ChronoDuration::hours(24),
            Timeframe::Day3 => ChronoDuration::days(3),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min5 => "5m",
            Timeframe::Min15 => "15m",
            Timeframe::Min30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Hour24 => "24h",
            Timeframe::Day3 => "3d",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|timeframe| timeframe.as_str() == s)
            .ok_or_else(|| MonitorError::Validation(format!("unknown timeframe: {s}")))
    }
}

/// Change measurement over one symbol's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowMeasure {
    /// Percent change from the window start price to the latest price
    pub change_percent: f64,
    /// Price at the selected window start
    pub start_price: f64,
    /// Latest observed price
    pub current_price: f64,
    /// Snapshots currently held for the symbol
    pub sample_count: usize,
}

/// Rolling per-symbol snapshot store for one timeframe.
///
/// Snapshots are appended in arrival order and pruned on every insert so that
/// everything retained satisfies `timestamp > now - duration`.
#[derive(Debug)]
pub struct TimeframeWindow {
    timeframe: Timeframe,
    snapshots: FnvHashMap<Symbol, VecDeque<PriceSnapshot>>,
}

impl TimeframeWindow {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            snapshots: FnvHashMap::default(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Append a snapshot for `symbol` and prune everything that has aged out
    /// of the window.
    pub fn push(&mut self, symbol: &Symbol, snapshot: PriceSnapshot) {
        let entries = self.snapshots.entry(symbol.clone()).or_default();
        entries.push_back(snapshot);

        let cutoff = snapshot.timestamp - self.timeframe.duration();
        while let Some(front) = entries.front() {
            if front.timestamp <= cutoff {
                entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Measure the change over this window for `symbol` as of `now`.
    ///
    /// The window start is the snapshot closest to `now - duration` among
    /// those at or before it; when none qualifies (the common case directly
    /// after pruning) the earliest retained snapshot is used. Returns `None`
    /// with fewer than two snapshots.
    pub fn measure(&self, symbol: &str, now: DateTime<Utc>) -> Option<WindowMeasure> {
        let entries = self.snapshots.get(symbol)?;
        if entries.len() < 2 {
            return None;
        }

        let cutoff = now - self.timeframe.duration();
        let start = entries
            .iter()
            .filter(|snapshot| snapshot.timestamp <= cutoff)
            .next_back()
            .or_else(|| entries.front())?;
        let current = entries.back()?;

        let change_percent = (current.price - start.price) / start.price * 100.0;
        Some(WindowMeasure {
            change_percent,
            start_price: start.price,
            current_price: current.price,
            sample_count: entries.len(),
        })
    }

    /// Drop aged-out snapshots for every symbol and forget symbols left empty.
    ///
    /// `push` only prunes the updated symbol, so idle symbols are reclaimed
    /// here on the maintenance cadence.
    pub fn prune_idle(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.timeframe.duration();
        self.snapshots.retain(|_, entries| {
            while let Some(front) = entries.front() {
                if front.timestamp <= cutoff {
                    entries.pop_front();
                } else {
                    break;
                }
            }
            !entries.is_empty()
        });
    }

    /// Symbols currently holding at least one snapshot.
    pub fn symbol_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Total snapshots held across all symbols.
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.values().map(VecDeque::len).sum()
    }
}
