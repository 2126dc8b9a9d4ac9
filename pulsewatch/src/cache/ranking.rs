use chrono::{DateTime, Utc};
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

use crate::market::Symbol;

/// One row of a sampled top-movers ranking.
///
/// Rankings are recomputed wholesale per sampling cycle; entries are never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankingEntry {
    /// Market symbol
    pub symbol: Symbol,
    /// 1-based position within the ranking
    pub position: usize,
    /// 24h percent change that earned the position
    pub price_change_percent: f64,
    /// Last traded price
    pub price: f64,
    /// 24h quote volume
    pub volume: f64,
}

/// Kind of movement detected between two ranking cycles.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingChangeKind {
    /// Symbol entered the ranking with a qualifying percent change
    NewEntry,
    /// Symbol moved at least the major-move threshold of positions
    PositionChange,
    /// Symbol left the ranking; reported for visibility only
    Exit,
}

/// One detected movement between two ranking cycles.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankingChange {
    pub symbol: Symbol,
    pub kind: RankingChangeKind,
    /// Position this cycle; `None` for exits
    pub current_position: Option<usize>,
    /// Position last cycle; `None` for new entries
    pub previous_position: Option<usize>,
    /// `previous - current`; positive means the symbol moved up
    pub change_value: Option<i64>,
    /// 24h percent change at detection time
    pub price_change_percent: f64,
}

impl RankingChange {
    /// Exits are visibility-only and never make a cycle significant.
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, RankingChangeKind::Exit)
    }
}

/// Composite event emitted when a sampling cycle detects at least one
/// significant change.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankingChangeSet {
    pub changes: Vec<RankingChange>,
    pub sampled_at: DateTime<Utc>,
}

impl RankingChangeSet {
    pub fn has_significant(&self) -> bool {
        self.changes.iter().any(RankingChange::is_significant)
    }
}

/// Detects significant movements between consecutive ranking cycles.
///
/// Runs in O(K) for depth-K rankings via a symbol -> position index of the
/// previous cycle.
#[derive(Debug, Clone)]
pub struct RankingDetector {
    /// Percent change a newcomer must carry to be reported
    min_gain_percent: f64,
    /// Absolute position delta that counts as a major move
    major_move_threshold: usize,
}

impl RankingDetector {
    pub fn new(min_gain_percent: f64, major_move_threshold: usize) -> Self {
        Self {
            min_gain_percent,
            major_move_threshold,
        }
    }

    /// Diff two consecutive ranking cycles.
    ///
    /// Sub-threshold movements produce nothing at all.
    pub fn diff(
        &self,
        previous: &[RankingEntry],
        current: &[RankingEntry],
    ) -> Vec<RankingChange> {
        let previous_positions: FnvHashMap<&str, usize> = previous
            .iter()
            .map(|entry| (entry.symbol.as_str(), entry.position))
            .collect();
        let current_symbols: FnvHashSet<&str> = current
            .iter()
            .map(|entry| entry.symbol.as_str())
            .collect();

        let mut changes = Vec::new();

        for entry in current {
            match previous_positions.get(entry.symbol.as_str()) {
                None => {
                    if entry.price_change_percent >= self.min_gain_percent {
                        changes.push(RankingChange {
                            symbol: entry.symbol.clone(),
                            kind: RankingChangeKind::NewEntry,
                            current_position: Some(entry.position),
                            previous_position: None,
                            change_value: None,
                            price_change_percent: entry.price_change_percent,
                        });
                    }
                }
                Some(&previous_position) => {
                    let delta = previous_position as i64 - entry.position as i64;
                    if delta.unsigned_abs() as usize >= self.major_move_threshold {
                        changes.push(RankingChange {
                            symbol: entry.symbol.clone(),
                            kind: RankingChangeKind::PositionChange,
                            current_position: Some(entry.position),
                            previous_position: Some(previous_position),
                            change_value: Some(delta),
                            price_change_percent: entry.price_change_percent,
                        });
                    }
                }
            }
        }

        for entry in previous {
            if !current_symbols.contains(entry.symbol.as_str()) {
                changes.push(RankingChange {
                    symbol: entry.symbol.clone(),
                    kind: RankingChangeKind::Exit,
                    current_position: None,
                    previous_position: Some(entry.position),
                    change_value: None,
                    price_change_percent: entry.price_change_percent,
                });
            }
        }

        changes
    }
}
