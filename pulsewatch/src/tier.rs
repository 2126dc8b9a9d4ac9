use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vecmap::VecMap;

use crate::{config::TierConfig, market::Symbol};

/// Volume tier a symbol is classified into.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeTierKind {
    High,
    Medium,
    Low,
}

impl VolumeTierKind {
    /// Every tier, highest priority first.
    pub const ALL: [VolumeTierKind; 3] = [
        VolumeTierKind::High,
        VolumeTierKind::Medium,
        VolumeTierKind::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeTierKind::High => "high",
            VolumeTierKind::Medium => "medium",
            VolumeTierKind::Low => "low",
        }
    }
}

impl std::fmt::Display for VolumeTierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// REST-sourced data types the scheduler paces independently.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Ticker,
    Funding,
    OpenInterest,
}

impl DataType {
    pub const ALL: [DataType; 3] = [DataType::Ticker, DataType::Funding, DataType::OpenInterest];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Ticker => "ticker",
            DataType::Funding => "funding",
            DataType::OpenInterest => "open_interest",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tier refresh counters for one driver cycle.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TierCycleStats {
    /// Symbols handed out for fetching
    pub requested: u64,
    /// Symbols successfully refreshed
    pub updated: u64,
    /// Symbols whose fetch failed or returned nothing
    pub skipped: u64,
}

/// Adaptive refresh scheduler pacing REST fetches by 24h volume tier.
///
/// Classification runs on its own cadence; between classifications every
/// symbol keeps its tier. Refresh deadlines are tracked per (symbol, data
/// type) so funding can lag tickers without starving either.
pub struct VolumeTierScheduler {
    config: TierConfig,
    tiers: FnvHashMap<Symbol, VolumeTierKind>,
    /// Tier membership ordered by descending volume, rebuilt per classification
    buckets: VecMap<VolumeTierKind, Vec<Symbol>>,
    next_update: FnvHashMap<(Symbol, DataType), DateTime<Utc>>,
    stats: VecMap<VolumeTierKind, TierCycleStats>,
    last_cycle: VecMap<VolumeTierKind, TierCycleStats>,
}

impl VolumeTierScheduler {
    pub fn new(config: TierConfig) -> Self {
        let mut buckets = VecMap::with_capacity(VolumeTierKind::ALL.len());
        let mut stats = VecMap::with_capacity(VolumeTierKind::ALL.len());
        let mut last_cycle = VecMap::with_capacity(VolumeTierKind::ALL.len());
        for tier in VolumeTierKind::ALL {
            buckets.insert(tier, Vec::new());
            stats.insert(tier, TierCycleStats::default());
            last_cycle.insert(tier, TierCycleStats::default());
        }

        Self {
            config,
            tiers: FnvHashMap::default(),
            buckets,
            next_update: FnvHashMap::default(),
            stats,
            last_cycle,
        }
    }

    /// Reclassify every symbol from its current 24h quote volume.
    ///
    /// Symbols absent from `volumes` are dropped along with their deadlines;
    /// surviving symbols keep theirs so a tier change never forces an
    /// immediate fetch.
    pub fn classify<'a>(&mut self, volumes: impl IntoIterator<Item = (&'a Symbol, f64)>) {
        let mut ranked: Vec<(Symbol, f64)> = volumes
            .into_iter()
            .map(|(symbol, volume)| (symbol.clone(), volume))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        self.tiers.clear();
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }

        for (symbol, volume) in ranked {
            let tier = self.tier_for_volume(volume);
            self.tiers.insert(symbol.clone(), tier);
            if let Some(bucket) = self.buckets.get_mut(&tier) {
                bucket.push(symbol);
            }
        }

        let tiers = &self.tiers;
        self.next_update
            .retain(|(symbol, _), _| tiers.contains_key(symbol));

        info!(
            high = self.buckets.get(&VolumeTierKind::High).map_or(0, Vec::len),
            medium = self.buckets.get(&VolumeTierKind::Medium).map_or(0, Vec::len),
            low = self.buckets.get(&VolumeTierKind::Low).map_or(0, Vec::len),
            "volume tiers classified"
        );
    }

    /// Symbols due a refresh for `data_type`, higher tiers first, truncated to
    /// the fetch budget. Handed-out symbols are counted as requested.
    pub fn due_for_refresh(&mut self, data_type: DataType, now: DateTime<Utc>) -> Vec<Symbol> {
        let mut due = Vec::new();

        'tiers: for tier in VolumeTierKind::ALL {
            let Some(bucket) = self.buckets.get(&tier) else {
                continue;
            };
            for symbol in bucket {
                if due.len() >= self.config.fetch_budget {
                    break 'tiers;
                }
                let ready = match self.next_update.get(&(symbol.clone(), data_type)) {
                    Some(deadline) => *deadline <= now,
                    None => true,
                };
                if ready {
                    due.push(symbol.clone());
                    if let Some(stats) = self.stats.get_mut(&tier) {
                        stats.requested += 1;
                    }
                }
            }
        }

        if !due.is_empty() {
            debug!(data_type = %data_type, count = due.len(), "symbols due for refresh");
        }
        due
    }

    /// Record a successful refresh, pushing the next deadline one tier
    /// interval out.
    pub fn record_refresh(&mut self, symbol: &Symbol, data_type: DataType, now: DateTime<Utc>) {
        let tier = self.tier_or_low(symbol);
        let interval = self.config.interval(tier, data_type);
        let deadline = ChronoDuration::from_std(interval)
            .ok()
            .and_then(|interval| now.checked_add_signed(interval))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_update.insert((symbol.clone(), data_type), deadline);
        if let Some(stats) = self.stats.get_mut(&tier) {
            stats.updated += 1;
        }
    }

    /// Record a failed or empty fetch. The deadline is left untouched so the
    /// next cycle retries.
    pub fn record_skip(&mut self, symbol: &Symbol, _data_type: DataType) {
        let tier = self.tier_or_low(symbol);
        if let Some(stats) = self.stats.get_mut(&tier) {
            stats.skipped += 1;
        }
    }

    /// Close the current driver cycle: return its counters and reset them.
    pub fn take_cycle_stats(&mut self) -> Vec<(VolumeTierKind, TierCycleStats)> {
        let mut cycle = Vec::with_capacity(VolumeTierKind::ALL.len());
        for tier in VolumeTierKind::ALL {
            let stats = self
                .stats
                .get_mut(&tier)
                .map(std::mem::take)
                .unwrap_or_default();
            self.last_cycle.insert(tier, stats);
            cycle.push((tier, stats));
        }
        cycle
    }

    /// Counters of the most recently closed cycle.
    pub fn last_cycle_stats(&self) -> Vec<(VolumeTierKind, TierCycleStats)> {
        VolumeTierKind::ALL
            .into_iter()
            .map(|tier| {
                (
                    tier,
                    self.last_cycle.get(&tier).copied().unwrap_or_default(),
                )
            })
            .collect()
    }

    /// Symbols per tier.
    pub fn tier_counts(&self) -> Vec<(VolumeTierKind, usize)> {
        VolumeTierKind::ALL
            .into_iter()
            .map(|tier| (tier, self.buckets.get(&tier).map_or(0, Vec::len)))
            .collect()
    }

    /// Current tier of a symbol, if classified.
    pub fn tier_of(&self, symbol: &str) -> Option<VolumeTierKind> {
        self.tiers.get(symbol).copied()
    }

    fn tier_for_volume(&self, volume: f64) -> VolumeTierKind {
        if volume >= self.config.high_volume_floor {
            VolumeTierKind::High
        } else if volume >= self.config.medium_volume_floor {
            VolumeTierKind::Medium
        } else {
            VolumeTierKind::Low
        }
    }

    /// Unclassified symbols pace as low tier until the next classification.
    fn tier_or_low(&self, symbol: &str) -> VolumeTierKind {
        self.tier_of(symbol).unwrap_or(VolumeTierKind::Low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use smol_str::SmolStr;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap()
    }

    fn classified_scheduler() -> VolumeTierScheduler {
        let mut scheduler = VolumeTierScheduler::new(TierConfig::default());
        let volumes = vec![
            (SmolStr::new("BTCUSDT"), 9e9),
            (SmolStr::new("ETHUSDT"), 4e8),
            (SmolStr::new("MIDUSDT"), 5e7),
            (SmolStr::new("ZUSDT"), 2e6),
        ];
        scheduler.classify(volumes.iter().map(|(s, v)| (s, *v)));
        scheduler
    }

    #[test]
    fn test_classification_bands() {
        struct TestCase {
            volume: f64,
            expected: VolumeTierKind,
        }

        let scheduler = VolumeTierScheduler::new(TierConfig::default());
        let tests = vec![
            TestCase {
                // TC0: at the high floor
                volume: 100_000_000.0,
                expected: VolumeTierKind::High,
            },
            TestCase {
                // TC1: just under the high floor
                volume: 99_999_999.0,
                expected: VolumeTierKind::Medium,
            },
            TestCase {
                // TC2: at the medium floor
                volume: 10_000_000.0,
                expected: VolumeTierKind::Medium,
            },
            TestCase {
                // TC3: under the medium floor
                volume: 9_999_999.0,
                expected: VolumeTierKind::Low,
            },
            TestCase {
                // TC4: dust
                volume: 0.0,
                expected: VolumeTierKind::Low,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = scheduler.tier_for_volume(test.volume);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_unclassified_symbols_are_due_nothing() {
        let mut scheduler = VolumeTierScheduler::new(TierConfig::default());
        let due = scheduler.due_for_refresh(DataType::Ticker, base_time());
        assert!(due.is_empty());
    }

    #[test]
    fn test_due_orders_high_tier_first() {
        let mut scheduler = classified_scheduler();
        let due = scheduler.due_for_refresh(DataType::Ticker, base_time());

        // High tier (BTC 9e9, ETH 4e8) ahead of medium (MID) ahead of low (Z)
        let symbols: Vec<&str> = due.iter().map(|s| s.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "MIDUSDT", "ZUSDT"]);
    }

    #[test]
    fn test_fetch_budget_truncates_lower_tiers() {
        let mut scheduler =
            VolumeTierScheduler::new(TierConfig::default().with_fetch_budget(2));
        let volumes = vec![
            (SmolStr::new("BTCUSDT"), 9e9),
            (SmolStr::new("ETHUSDT"), 4e8),
            (SmolStr::new("ZUSDT"), 2e6),
        ];
        scheduler.classify(volumes.iter().map(|(s, v)| (s, *v)));

        let due = scheduler.due_for_refresh(DataType::Ticker, base_time());
        let symbols: Vec<&str> = due.iter().map(|s| s.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"], "low tier waits for budget");
    }

    #[test]
    fn test_low_tier_refresh_spacing() {
        // Low tier ticker interval is 1800000 ms
        let mut scheduler = classified_scheduler();
        let symbol = SmolStr::new("ZUSDT");
        let t0 = base_time();

        scheduler.record_refresh(&symbol, DataType::Ticker, t0);

        // 10 minutes later: not due
        let due = scheduler.due_for_refresh(DataType::Ticker, t0 + ChronoDuration::minutes(10));
        assert!(!due.contains(&symbol), "refresh inside the tier interval");

        // 31 minutes later: due again
        let due = scheduler.due_for_refresh(DataType::Ticker, t0 + ChronoDuration::minutes(31));
        assert!(due.contains(&symbol));
    }

    #[test]
    fn test_deadlines_are_per_data_type() {
        let mut scheduler = classified_scheduler();
        let symbol = SmolStr::new("BTCUSDT");
        let t0 = base_time();

        scheduler.record_refresh(&symbol, DataType::Ticker, t0);

        // Ticker was just refreshed; funding has never been fetched
        let due_ticker = scheduler.due_for_refresh(DataType::Ticker, t0);
        assert!(!due_ticker.contains(&symbol));
        let due_funding = scheduler.due_for_refresh(DataType::Funding, t0);
        assert!(due_funding.contains(&symbol));
    }

    #[test]
    fn test_cycle_stats_track_requested_updated_skipped() {
        let mut scheduler = classified_scheduler();
        let t0 = base_time();

        let due = scheduler.due_for_refresh(DataType::Funding, t0);
        assert_eq!(due.len(), 4);

        scheduler.record_refresh(&SmolStr::new("BTCUSDT"), DataType::Funding, t0);
        scheduler.record_refresh(&SmolStr::new("ETHUSDT"), DataType::Funding, t0);
        scheduler.record_skip(&SmolStr::new("MIDUSDT"), DataType::Funding);
        scheduler.record_skip(&SmolStr::new("ZUSDT"), DataType::Funding);

        let cycle: FnvHashMap<VolumeTierKind, TierCycleStats> =
            scheduler.take_cycle_stats().into_iter().collect();
        assert_eq!(cycle[&VolumeTierKind::High].requested, 2);
        assert_eq!(cycle[&VolumeTierKind::High].updated, 2);
        assert_eq!(cycle[&VolumeTierKind::High].skipped, 0);
        assert_eq!(cycle[&VolumeTierKind::Medium].skipped, 1);
        assert_eq!(cycle[&VolumeTierKind::Low].skipped, 1);

        // Counters reset after the cycle closes; the closed cycle is retained
        let next: FnvHashMap<VolumeTierKind, TierCycleStats> =
            scheduler.take_cycle_stats().into_iter().collect();
        assert_eq!(next[&VolumeTierKind::High], TierCycleStats::default());
        assert_eq!(
            scheduler
                .last_cycle_stats()
                .into_iter()
                .collect::<FnvHashMap<_, _>>()[&VolumeTierKind::High],
            TierCycleStats::default()
        );
    }

    #[test]
    fn test_classify_drops_departed_symbols() {
        let mut scheduler = classified_scheduler();
        assert!(scheduler.tier_of("ZUSDT").is_some());

        let volumes = vec![(SmolStr::new("BTCUSDT"), 9e9)];
        scheduler.classify(volumes.iter().map(|(s, v)| (s, *v)));

        assert!(scheduler.tier_of("ZUSDT").is_none());
        assert_eq!(scheduler.tier_counts()[0], (VolumeTierKind::High, 1));
    }

    #[test]
    fn test_tier_change_keeps_existing_deadline() {
        let mut scheduler = classified_scheduler();
        let symbol = SmolStr::new("ZUSDT");
        let t0 = base_time();

        scheduler.record_refresh(&symbol, DataType::Ticker, t0);

        // ZUSDT pumps into medium tier; its old deadline still stands
        let volumes = vec![(SmolStr::new("ZUSDT"), 5e7)];
        scheduler.classify(volumes.iter().map(|(s, v)| (s, *v)));
        assert_eq!(scheduler.tier_of("ZUSDT"), Some(VolumeTierKind::Medium));

        let due = scheduler.due_for_refresh(DataType::Ticker, t0 + ChronoDuration::minutes(10));
        assert!(!due.contains(&symbol), "deadline survives reclassification");
    }
}
