use std::sync::Arc;

use chrono::Utc;
use fnv::FnvHashMap;
use itertools::Itertools;
use tracing::debug;

use crate::{
    config::CacheConfig,
    market::{FundingSnapshot, OpenInterestStat, Symbol, SymbolFilter, TickerSnapshot},
};

use self::ranking::{RankingChangeSet, RankingDetector, RankingEntry};

pub mod ranking;

/// Listener invoked synchronously when a sampling cycle detects significant
/// ranking movement.
pub type RankingListener = Box<dyn Fn(&RankingChangeSet) + Send + Sync>;

/// Latest-state store for every eligible symbol plus the sampled top-movers
/// ranking.
///
/// Exclusively owns ticker, funding and open interest state; all writes come
/// through one consumer task, reads are point-in-time and side-effect free.
pub struct MarketStateCache {
    config: CacheConfig,
    filter: Arc<dyn SymbolFilter>,
    tickers: FnvHashMap<Symbol, TickerSnapshot>,
    funding: FnvHashMap<Symbol, FundingSnapshot>,
    open_interest: FnvHashMap<Symbol, OpenInterestStat>,
    detector: RankingDetector,
    previous_ranking: Vec<RankingEntry>,
    ingests: u64,
    listeners: Vec<RankingListener>,
}

impl MarketStateCache {
    pub fn new(config: CacheConfig, filter: Arc<dyn SymbolFilter>) -> Self {
        let detector =
            RankingDetector::new(config.min_gain_percent, config.major_move_threshold);
        Self {
            config,
            filter,
            tickers: FnvHashMap::default(),
            funding: FnvHashMap::default(),
            open_interest: FnvHashMap::default(),
            detector,
            previous_ranking: Vec::new(),
            ingests: 0,
            listeners: Vec::new(),
        }
    }

    /// Register a ranking-change listener. Listeners fire synchronously in
    /// registration order.
    pub fn on_ranking_change(
        &mut self,
        listener: impl Fn(&RankingChangeSet) + Send + Sync + 'static,
    ) {
        self.listeners.push(Box::new(listener));
    }

    /// Upsert a batch of validated ticker snapshots, skipping ineligible
    /// symbols, and resample the ranking when the cadence comes due.
    ///
    /// Returns the number of accepted records.
    pub fn ingest(&mut self, batch: Vec<TickerSnapshot>) -> usize {
        let mut accepted = 0usize;
        let mut skipped = 0usize;

        for ticker in batch {
            if !self.filter.is_eligible(&ticker.symbol) {
                skipped += 1;
                continue;
            }
            accepted += 1;
            self.tickers.insert(ticker.symbol.clone(), ticker);
        }

        if skipped > 0 {
            debug!(skipped, "dropped ineligible symbols from ticker batch");
        }

        self.ingests += 1;
        if self.ingests % u64::from(self.config.sampling_cadence) == 0 {
            self.sample_rankings();
        }

        accepted
    }

    /// Store the latest funding snapshot for a symbol.
    pub fn update_funding(&mut self, snapshot: FundingSnapshot) {
        self.funding.insert(snapshot.symbol.clone(), snapshot);
    }

    /// Store the latest open interest point for a symbol.
    pub fn update_open_interest(&mut self, stat: OpenInterestStat) {
        self.open_interest.insert(stat.symbol.clone(), stat);
    }

    /// Latest ticker state for one symbol.
    pub fn ticker(&self, symbol: &str) -> Option<&TickerSnapshot> {
        self.tickers.get(symbol)
    }

    /// Latest ticker state for several symbols; unknown symbols are omitted.
    pub fn batch_tickers<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<TickerSnapshot> {
        symbols
            .iter()
            .filter_map(|symbol| self.tickers.get(symbol.as_ref()).cloned())
            .collect()
    }

    /// Latest funding snapshot for one symbol.
    pub fn funding(&self, symbol: &str) -> Option<&FundingSnapshot> {
        self.funding.get(symbol)
    }

    /// Latest open interest point for one symbol.
    pub fn open_interest(&self, symbol: &str) -> Option<&OpenInterestStat> {
        self.open_interest.get(symbol)
    }

    /// Positive movers above the volume floor, strongest first.
    pub fn top_gainers(&self, limit: usize, min_volume: f64) -> Vec<RankingEntry> {
        self.tickers
            .values()
            .filter(|ticker| ticker.price_change_percent > 0.0 && ticker.volume >= min_volume)
            .sorted_by(|a, b| b.price_change_percent.total_cmp(&a.price_change_percent))
            .take(limit)
            .enumerate()
            .map(|(index, ticker)| Self::entry(ticker, index + 1))
            .collect()
    }

    /// Negative movers above the volume floor, weakest first.
    pub fn top_losers(&self, limit: usize, min_volume: f64) -> Vec<RankingEntry> {
        self.tickers
            .values()
            .filter(|ticker| ticker.price_change_percent < 0.0 && ticker.volume >= min_volume)
            .sorted_by(|a, b| a.price_change_percent.total_cmp(&b.price_change_percent))
            .take(limit)
            .enumerate()
            .map(|(index, ticker)| Self::entry(ticker, index + 1))
            .collect()
    }

    /// 24h quote volume per tracked symbol, for tier classification.
    pub fn volumes(&self) -> impl Iterator<Item = (&Symbol, f64)> {
        self.tickers
            .iter()
            .map(|(symbol, ticker)| (symbol, ticker.volume))
    }

    /// Symbols currently tracked.
    pub fn symbol_count(&self) -> usize {
        self.tickers.len()
    }

    /// Batches ingested so far.
    pub fn ingest_count(&self) -> u64 {
        self.ingests
    }

    fn entry(ticker: &TickerSnapshot, position: usize) -> RankingEntry {
        RankingEntry {
            symbol: ticker.symbol.clone(),
            position,
            price_change_percent: ticker.price_change_percent,
            price: ticker.price,
            volume: ticker.volume,
        }
    }

    /// Recompute the top-gainer ranking and dispatch a composite event when
    /// at least one change is significant.
    fn sample_rankings(&mut self) {
        let current =
            self.top_gainers(self.config.top_depth, self.config.min_ranking_volume);
        let changes = self.detector.diff(&self.previous_ranking, &current);
        self.previous_ranking = current;

        if changes.is_empty() {
            return;
        }

        let set = RankingChangeSet {
            changes,
            sampled_at: Utc::now(),
        };
        if !set.has_significant() {
            return;
        }

        debug!(changes = set.changes.len(), "ranking movement detected");
        for listener in &self.listeners {
            listener(&set);
        }
    }
}
