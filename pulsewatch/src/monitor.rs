use std::sync::Arc;

use chrono::Utc;
use fnv::FnvHashSet;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    alert::{AlertEngine, rule::AlertRuleStore, timeframe::Timeframe},
    cache::{
        MarketStateCache,
        ranking::{RankingChangeKind, RankingChangeSet, RankingEntry},
    },
    config::MonitorConfig,
    error::MonitorError,
    feed::{FeedClient, FeedState, protocol},
    market::{SymbolFilter, TickerSnapshot},
    notify::{NotificationOptions, NotificationSink},
    rest::MarketDataApi,
    tier::{DataType, TierCycleStats, VolumeTierKind, VolumeTierScheduler},
};

/// Point-in-time operational counters across every component.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub feed_state: FeedState,
    pub symbols_tracked: usize,
    pub batches_ingested: u64,
    pub rules_loaded: usize,
    pub active_cooldowns: usize,
    pub alerts_triggered: u64,
    pub alerts_suppressed: u64,
    pub window_depths: Vec<(Timeframe, usize)>,
    pub tier_counts: Vec<(VolumeTierKind, usize)>,
    pub last_refresh_cycle: Vec<(VolumeTierKind, TierCycleStats)>,
}

/// Top-level monitor wiring the feed, cache, alert engine and refresh
/// scheduler together.
///
/// One consumer task serializes all market state writes; periodic work
/// (REST refresh, tier classification, cooldown sweeps, stats) runs on a
/// second task. Everything stops through [`stop`](Self::stop).
pub struct MarketMonitor {
    config: MonitorConfig,
    filter: Arc<dyn SymbolFilter>,
    cache: Arc<RwLock<MarketStateCache>>,
    engine: Arc<Mutex<AlertEngine>>,
    scheduler: Arc<Mutex<VolumeTierScheduler>>,
    feed: FeedClient,
    api: Arc<dyn MarketDataApi>,
    notifier: Arc<dyn NotificationSink>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MarketMonitor {
    pub fn new(
        config: MonitorConfig,
        filter: Arc<dyn SymbolFilter>,
        api: Arc<dyn MarketDataApi>,
        store: Arc<dyn AlertRuleStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let cache = Arc::new(RwLock::new(MarketStateCache::new(
            config.cache.clone(),
            Arc::clone(&filter),
        )));
        let engine = Arc::new(Mutex::new(AlertEngine::new(
            config.alert.clone(),
            store,
            Arc::clone(&notifier),
        )));
        let scheduler = Arc::new(Mutex::new(VolumeTierScheduler::new(config.tier.clone())));
        let feed = FeedClient::new(config.feed.clone());
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            filter,
            cache,
            engine,
            scheduler,
            feed,
            api,
            notifier,
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Load rules, open the feed and spawn the worker tasks.
    ///
    /// A failed initial rule load is logged and startup continues with an
    /// empty rule set; a later [`reload_rules`](Self::reload_rules) can
    /// recover. No-op when already started.
    pub async fn start(&mut self) -> Result<(), MonitorError> {
        if !self.tasks.is_empty() {
            debug!("monitor already started");
            return Ok(());
        }
        info!("starting market monitor");

        let _ = self.engine.lock().await.reload_rules().await;

        if let Some(channel) = self.config.ranking_channel.clone() {
            let (rank_tx, rank_rx) = mpsc::unbounded_channel::<RankingChangeSet>();
            self.cache.write().on_ranking_change(move |set| {
                let _ = rank_tx.send(set.clone());
            });
            self.tasks.push(tokio::spawn(ranking_notify_loop(
                rank_rx,
                Arc::clone(&self.notifier),
                channel,
                self.shutdown.subscribe(),
            )));
        }

        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Vec<TickerSnapshot>>();
        self.feed
            .subscribe("!ticker@arr", move |data| {
                let batch = protocol::parse_ticker_batch(data);
                if !batch.is_empty() {
                    let _ = batch_tx.send(batch);
                }
            })
            .await;
        self.feed.connect()?;

        self.tasks.push(tokio::spawn(consume_batches(
            batch_rx,
            Arc::clone(&self.filter),
            Arc::clone(&self.cache),
            Arc::clone(&self.engine),
            self.shutdown.subscribe(),
        )));

        self.tasks.push(tokio::spawn(periodic_loop(
            self.config.clone(),
            Arc::clone(&self.cache),
            Arc::clone(&self.engine),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.api),
            self.feed.state(),
            self.shutdown.subscribe(),
        )));

        Ok(())
    }

    /// Stop the feed and every worker task.
    pub async fn stop(&mut self) {
        info!("stopping market monitor");
        self.shutdown.send_replace(true);
        self.feed.disconnect().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("market monitor stopped");
    }

    /// Inject one price observation into the alert engine.
    ///
    /// The stream consumer feeds the engine the same way; this entry point
    /// serves callers replaying or synthesizing prices. Ineligible symbols
    /// are ignored and evaluation never raises.
    pub async fn on_price_update(&self, symbol: &str, price: f64, volume24h: f64) {
        if !self.filter.is_eligible(symbol) {
            return;
        }
        self.engine
            .lock()
            .await
            .on_price_update(symbol, price, volume24h, Utc::now())
            .await;
    }

    /// Strongest positive movers above the configured volume floor.
    pub fn top_gainers(&self, limit: usize) -> Vec<RankingEntry> {
        self.cache
            .read()
            .top_gainers(limit, self.config.cache.min_ranking_volume)
    }

    /// Weakest negative movers above the configured volume floor.
    pub fn top_losers(&self, limit: usize) -> Vec<RankingEntry> {
        self.cache
            .read()
            .top_losers(limit, self.config.cache.min_ranking_volume)
    }

    /// Latest ticker state for one symbol.
    pub fn ticker(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.cache.read().ticker(symbol).cloned()
    }

    /// Latest ticker state for several symbols; unknown symbols are omitted.
    pub fn batch_tickers<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<TickerSnapshot> {
        self.cache.read().batch_tickers(symbols)
    }

    /// Re-read alert rules from the store.
    pub async fn reload_rules(&self) -> Result<usize, MonitorError> {
        self.engine.lock().await.reload_rules().await
    }

    /// Watch the feed connection state machine.
    pub fn feed_state(&self) -> watch::Receiver<FeedState> {
        self.feed.state()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Operational counters across every component.
    pub async fn stats(&self) -> MonitorStats {
        snapshot_stats(
            &self.cache,
            &self.engine,
            &self.scheduler,
            self.feed.current_state(),
        )
        .await
    }
}

/// Drain ticker batches from the feed into the engine and cache.
async fn consume_batches(
    mut batches: mpsc::UnboundedReceiver<Vec<TickerSnapshot>>,
    filter: Arc<dyn SymbolFilter>,
    cache: Arc<RwLock<MarketStateCache>>,
    engine: Arc<Mutex<AlertEngine>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            batch = batches.recv() => {
                let Some(batch) = batch else { break };
                let batch: Vec<TickerSnapshot> = batch
                    .into_iter()
                    .filter(|ticker| filter.is_eligible(&ticker.symbol))
                    .collect();
                if batch.is_empty() {
                    continue;
                }
                {
                    let mut engine = engine.lock().await;
                    for ticker in &batch {
                        engine
                            .on_price_update(
                                &ticker.symbol,
                                ticker.price,
                                ticker.volume,
                                ticker.timestamp,
                            )
                            .await;
                    }
                }
                cache.write().ingest(batch);
            }
        }
    }
    debug!("batch consumer stopped");
}

/// Forward sampled ranking movement to the notification channel.
async fn ranking_notify_loop(
    mut changes: mpsc::UnboundedReceiver<RankingChangeSet>,
    notifier: Arc<dyn NotificationSink>,
    destination: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            set = changes.recv() => {
                let Some(set) = set else { break };
                let text = format_ranking_message(&set);
                if text.is_empty() {
                    continue;
                }
                if let Err(error) = notifier
                    .send(&destination, &text, &NotificationOptions::silent())
                    .await
                {
                    warn!(%error, "ranking notification dispatch failed");
                }
            }
        }
    }
    debug!("ranking notifier stopped");
}

fn format_ranking_message(set: &RankingChangeSet) -> String {
    let mut lines = Vec::new();
    for change in &set.changes {
        match change.kind {
            RankingChangeKind::NewEntry => {
                let Some(position) = change.current_position else {
                    continue;
                };
                lines.push(format!(
                    "{} entered the gainer board at #{} ({:+.2}%)",
                    change.symbol, position, change.price_change_percent
                ));
            }
            RankingChangeKind::PositionChange => {
                let Some(position) = change.current_position else {
                    continue;
                };
                let movement = change.change_value.unwrap_or(0);
                let verb = if movement > 0 { "climbed" } else { "dropped" };
                lines.push(format!(
                    "{} {} {} places to #{} ({:+.2}%)",
                    change.symbol,
                    verb,
                    movement.unsigned_abs(),
                    position,
                    change.price_change_percent
                ));
            }
            RankingChangeKind::Exit => {
                lines.push(format!("{} left the gainer board", change.symbol));
            }
        }
    }
    lines.join("\n")
}

/// Periodic driver: REST refresh, tier classification, cooldown sweeps
/// and the stats log line.
async fn periodic_loop(
    config: MonitorConfig,
    cache: Arc<RwLock<MarketStateCache>>,
    engine: Arc<Mutex<AlertEngine>>,
    scheduler: Arc<Mutex<VolumeTierScheduler>>,
    api: Arc<dyn MarketDataApi>,
    feed_state: watch::Receiver<FeedState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut refresh = tokio::time::interval(config.refresh_tick);
    let mut classify = tokio::time::interval(config.classify_interval);
    let mut sweep = tokio::time::interval(config.sweep_interval);
    let mut stats = tokio::time::interval(config.stats_interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = classify.tick() => {
                let mut scheduler = scheduler.lock().await;
                let cache = cache.read();
                scheduler.classify(cache.volumes());
            }
            _ = refresh.tick() => {
                run_refresh_cycle(&cache, &scheduler, api.as_ref()).await;
            }
            _ = sweep.tick() => {
                engine.lock().await.sweep(Utc::now());
            }
            _ = stats.tick() => {
                let feed = *feed_state.borrow();
                let snapshot =
                    snapshot_stats(&cache, &engine, &scheduler, feed).await;
                info!(
                    feed_state = %snapshot.feed_state,
                    symbols = snapshot.symbols_tracked,
                    batches = snapshot.batches_ingested,
                    rules = snapshot.rules_loaded,
                    cooldowns = snapshot.active_cooldowns,
                    triggered = snapshot.alerts_triggered,
                    suppressed = snapshot.alerts_suppressed,
                    "monitor stats"
                );
            }
        }
    }
    debug!("periodic driver stopped");
}

/// One REST refresh pass: fetch whatever the scheduler says is due.
async fn run_refresh_cycle(
    cache: &Arc<RwLock<MarketStateCache>>,
    scheduler: &Arc<Mutex<VolumeTierScheduler>>,
    api: &dyn MarketDataApi,
) {
    let now = Utc::now();

    // Day stats come back for every instrument in one call, so the due
    // set only decides which records are kept.
    let due_tickers = scheduler.lock().await.due_for_refresh(DataType::Ticker, now);
    if !due_tickers.is_empty() {
        match api.day_stats_all().await {
            Ok(stats) => {
                let refreshed: Vec<TickerSnapshot> = {
                    let due: FnvHashSet<&str> =
                        due_tickers.iter().map(|symbol| symbol.as_str()).collect();
                    stats
                        .into_iter()
                        .filter(|snapshot| due.contains(snapshot.symbol.as_str()))
                        .collect()
                };
                {
                    let returned: FnvHashSet<&str> =
                        refreshed.iter().map(|snapshot| snapshot.symbol.as_str()).collect();
                    let mut scheduler = scheduler.lock().await;
                    for symbol in &due_tickers {
                        if returned.contains(symbol.as_str()) {
                            scheduler.record_refresh(symbol, DataType::Ticker, now);
                        } else {
                            scheduler.record_skip(symbol, DataType::Ticker);
                        }
                    }
                }
                cache.write().ingest(refreshed);
            }
            Err(error) => {
                let mut scheduler = scheduler.lock().await;
                for symbol in &due_tickers {
                    scheduler.record_skip(symbol, DataType::Ticker);
                }
                drop(scheduler);
                if error.is_rate_limit() {
                    debug!(%error, "ticker refresh rate limited");
                } else {
                    warn!(%error, "ticker refresh failed");
                }
            }
        }
    }

    let due_funding = scheduler.lock().await.due_for_refresh(DataType::Funding, now);
    for (index, symbol) in due_funding.iter().enumerate() {
        match api.funding_rate(symbol).await {
            Ok(snapshot) => {
                cache.write().update_funding(snapshot);
                scheduler
                    .lock()
                    .await
                    .record_refresh(symbol, DataType::Funding, now);
            }
            Err(error) if error.is_rate_limit() => {
                debug!(%error, deferred = due_funding.len() - index, "funding refresh rate limited");
                let mut scheduler = scheduler.lock().await;
                for deferred in &due_funding[index..] {
                    scheduler.record_skip(deferred, DataType::Funding);
                }
                break;
            }
            Err(error) => {
                warn!(symbol = %symbol, %error, "funding refresh failed");
                scheduler.lock().await.record_skip(symbol, DataType::Funding);
            }
        }
    }

    let due_open_interest = scheduler
        .lock()
        .await
        .due_for_refresh(DataType::OpenInterest, now);
    for (index, symbol) in due_open_interest.iter().enumerate() {
        match api.open_interest(symbol, "5m", 1).await {
            Ok(stats) => match stats.into_iter().next_back() {
                Some(stat) => {
                    cache.write().update_open_interest(stat);
                    scheduler
                        .lock()
                        .await
                        .record_refresh(symbol, DataType::OpenInterest, now);
                }
                None => {
                    debug!(symbol = %symbol, "open interest history empty");
                    scheduler
                        .lock()
                        .await
                        .record_skip(symbol, DataType::OpenInterest);
                }
            },
            Err(error) if error.is_rate_limit() => {
                debug!(
                    %error,
                    deferred = due_open_interest.len() - index,
                    "open interest refresh rate limited"
                );
                let mut scheduler = scheduler.lock().await;
                for deferred in &due_open_interest[index..] {
                    scheduler.record_skip(deferred, DataType::OpenInterest);
                }
                break;
            }
            Err(error) => {
                warn!(symbol = %symbol, %error, "open interest refresh failed");
                scheduler
                    .lock()
                    .await
                    .record_skip(symbol, DataType::OpenInterest);
            }
        }
    }

    let cycle = scheduler.lock().await.take_cycle_stats();
    for (tier, stats) in cycle {
        if stats.requested > 0 {
            info!(
                tier = %tier,
                requested = stats.requested,
                updated = stats.updated,
                skipped = stats.skipped,
                "refresh cycle"
            );
        }
    }
}

async fn snapshot_stats(
    cache: &Arc<RwLock<MarketStateCache>>,
    engine: &Arc<Mutex<AlertEngine>>,
    scheduler: &Arc<Mutex<VolumeTierScheduler>>,
    feed_state: FeedState,
) -> MonitorStats {
    let (symbols_tracked, batches_ingested) = {
        let cache = cache.read();
        (cache.symbol_count(), cache.ingest_count())
    };
    let (rules_loaded, active_cooldowns, alerts_triggered, alerts_suppressed, window_depths) = {
        let engine = engine.lock().await;
        (
            engine.rules_loaded(),
            engine.active_cooldowns(),
            engine.triggered_total(),
            engine.suppressed_total(),
            engine.window_depths(),
        )
    };
    let (tier_counts, last_refresh_cycle) = {
        let scheduler = scheduler.lock().await;
        (scheduler.tier_counts(), scheduler.last_cycle_stats())
    };

    MonitorStats {
        feed_state,
        symbols_tracked,
        batches_ingested,
        rules_loaded,
        active_cooldowns,
        alerts_triggered,
        alerts_suppressed,
        window_depths,
        tier_counts,
        last_refresh_cycle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::rule::{AlertDirection, AlertRule, StaticRuleStore};
    use crate::config::{AlertConfig, CacheConfig, TierConfig};
    use crate::market::{FundingSnapshot, OpenInterestStat, StaticSymbolFilter, Symbol};
    use crate::notify::MemorySink;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ticker(symbol: &str, price: f64, change_percent: f64, volume: f64) -> TickerSnapshot {
        TickerSnapshot {
            symbol: Symbol::new(symbol),
            price,
            price_change: price * change_percent / 100.0,
            price_change_percent: change_percent,
            volume,
            timestamp: Utc::now(),
        }
    }

    /// Scripted venue API with per-endpoint call counters.
    struct ScriptedApi {
        day_stats: Vec<TickerSnapshot>,
        day_stats_calls: AtomicUsize,
        funding_calls: AtomicUsize,
        open_interest_calls: AtomicUsize,
        rate_limit_funding: bool,
    }

    impl ScriptedApi {
        fn new(day_stats: Vec<TickerSnapshot>) -> Self {
            Self {
                day_stats,
                day_stats_calls: AtomicUsize::new(0),
                funding_calls: AtomicUsize::new(0),
                open_interest_calls: AtomicUsize::new(0),
                rate_limit_funding: false,
            }
        }

        fn with_rate_limited_funding(mut self) -> Self {
            self.rate_limit_funding = true;
            self
        }
    }

    #[async_trait]
    impl MarketDataApi for ScriptedApi {
        async fn day_stats_all(&self) -> Result<Vec<TickerSnapshot>, MonitorError> {
            self.day_stats_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.day_stats.clone())
        }

        async fn funding_rate(&self, symbol: &str) -> Result<FundingSnapshot, MonitorError> {
            self.funding_calls.fetch_add(1, Ordering::SeqCst);
            if self.rate_limit_funding {
                return Err(MonitorError::RateLimited("429".to_string()));
            }
            Ok(FundingSnapshot {
                symbol: Symbol::new(symbol),
                rate: 0.0001,
                index_price: Some(100.0),
                next_funding_time: None,
                timestamp: Utc::now(),
            })
        }

        async fn open_interest(
            &self,
            symbol: &str,
            _period: &str,
            limit: usize,
        ) -> Result<Vec<OpenInterestStat>, MonitorError> {
            self.open_interest_calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..limit)
                .map(|i| OpenInterestStat {
                    symbol: Symbol::new(symbol),
                    open_interest: 1000.0 + i as f64,
                    notional: Some(1e8),
                    timestamp: Utc::now(),
                })
                .collect())
        }
    }

    fn shared_cache(tickers: Vec<TickerSnapshot>) -> Arc<RwLock<MarketStateCache>> {
        let mut cache = MarketStateCache::new(
            CacheConfig::default(),
            Arc::new(StaticSymbolFilter::allow_all()),
        );
        cache.ingest(tickers);
        Arc::new(RwLock::new(cache))
    }

    #[tokio::test]
    async fn test_refresh_cycle_fetches_due_symbols_once() {
        let cache = shared_cache(vec![
            ticker("BTCUSDT", 50_000.0, 2.0, 2e8),
            ticker("ZUSDT", 1.0, 1.0, 5e5),
        ]);
        let scheduler = Arc::new(Mutex::new(VolumeTierScheduler::new(TierConfig::default())));
        scheduler.lock().await.classify(cache.read().volumes());
        let api = Arc::new(ScriptedApi::new(vec![
            ticker("BTCUSDT", 50_100.0, 2.1, 2e8),
            ticker("ZUSDT", 1.01, 1.2, 5e5),
            ticker("UNTRACKED", 9.0, 0.5, 1e9),
        ]));

        run_refresh_cycle(&cache, &scheduler, api.as_ref()).await;

        assert_eq!(api.day_stats_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.funding_calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.open_interest_calls.load(Ordering::SeqCst), 2);
        {
            let cache = cache.read();
            assert_eq!(cache.ticker("BTCUSDT").unwrap().price, 50_100.0);
            assert!(cache.ticker("UNTRACKED").is_none(), "only due symbols are kept");
            assert!(cache.funding("BTCUSDT").is_some());
            assert!(cache.open_interest("ZUSDT").is_some());
        }
        let cycle = scheduler.lock().await.last_cycle_stats();
        let total_updated: u64 = cycle.iter().map(|(_, stats)| stats.updated).sum();
        assert_eq!(total_updated, 6, "two symbols across three data types");

        // Deadlines are now in the future: an immediate second cycle fetches nothing
        run_refresh_cycle(&cache, &scheduler, api.as_ref()).await;
        assert_eq!(api.day_stats_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.funding_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limited_funding_defers_the_rest_of_the_cycle() {
        let cache = shared_cache(vec![
            ticker("BTCUSDT", 50_000.0, 2.0, 2e8),
            ticker("ETHUSDT", 3_000.0, 1.5, 2e8),
        ]);
        let scheduler = Arc::new(Mutex::new(VolumeTierScheduler::new(TierConfig::default())));
        scheduler.lock().await.classify(cache.read().volumes());
        let api = Arc::new(ScriptedApi::new(Vec::new()).with_rate_limited_funding());

        run_refresh_cycle(&cache, &scheduler, api.as_ref()).await;

        assert_eq!(
            api.funding_calls.load(Ordering::SeqCst),
            1,
            "first 429 stops the funding pass"
        );
        let cycle = scheduler.lock().await.last_cycle_stats();
        let funding_skipped: u64 = cycle.iter().map(|(_, stats)| stats.skipped).sum();
        assert!(funding_skipped >= 2, "both due funding symbols count as skipped");

        // Nothing recorded as refreshed: the next cycle retries both
        run_refresh_cycle(&cache, &scheduler, api.as_ref()).await;
        assert_eq!(api.funding_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_consume_batches_filters_then_feeds_engine_and_cache() {
        let filter: Arc<dyn SymbolFilter> =
            Arc::new(StaticSymbolFilter::deny(["SCAMUSDT"]));
        let cache = Arc::new(RwLock::new(MarketStateCache::new(
            CacheConfig::default(),
            Arc::clone(&filter),
        )));
        let sink = Arc::new(MemorySink::new());
        let rules = vec![AlertRule {
            id: Symbol::new("r1"),
            user_id: Symbol::new("chat-1"),
            symbol: Some(Symbol::new("BTCUSDT")),
            timeframe: Timeframe::Min1,
            direction: AlertDirection::Gain,
            threshold_percent: 5.0,
            enabled: true,
        }];
        let engine = Arc::new(Mutex::new(AlertEngine::new(
            AlertConfig::default(),
            Arc::new(StaticRuleStore::new(rules)),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        )));
        engine.lock().await.reload_rules().await.unwrap();

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = tokio::spawn(consume_batches(
            batch_rx,
            Arc::clone(&filter),
            Arc::clone(&cache),
            Arc::clone(&engine),
            shutdown_rx,
        ));

        let t0: DateTime<Utc> = Utc::now();
        let mut first = ticker("BTCUSDT", 100.0, 0.0, 1e9);
        first.timestamp = t0;
        let mut second = ticker("BTCUSDT", 110.0, 10.0, 1e9);
        second.timestamp = t0 + ChronoDuration::seconds(30);
        let mut scam = ticker("SCAMUSDT", 0.01, 900.0, 100.0);
        scam.timestamp = t0;

        batch_tx.send(vec![first, scam]).unwrap();
        batch_tx.send(vec![second]).unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while sink.sent().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "alert never fired");

        assert!(sink.sent()[0].text.contains("+10.00% in 1m"));
        {
            let cache = cache.read();
            assert_eq!(cache.symbol_count(), 1, "denied symbol never reaches the cache");
            assert_eq!(cache.ticker("BTCUSDT").unwrap().price, 110.0);
        }

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer did not stop")
            .unwrap();
    }

    fn newcomer_set() -> RankingChangeSet {
        RankingChangeSet {
            changes: vec![
                crate::cache::ranking::RankingChange {
                    symbol: Symbol::new("XUSDT"),
                    kind: RankingChangeKind::NewEntry,
                    current_position: Some(3),
                    previous_position: None,
                    change_value: None,
                    price_change_percent: 12.4,
                },
                crate::cache::ranking::RankingChange {
                    symbol: Symbol::new("YUSDT"),
                    kind: RankingChangeKind::PositionChange,
                    current_position: Some(2),
                    previous_position: Some(9),
                    change_value: Some(7),
                    price_change_percent: 8.1,
                },
                crate::cache::ranking::RankingChange {
                    symbol: Symbol::new("ZUSDT"),
                    kind: RankingChangeKind::Exit,
                    current_position: None,
                    previous_position: Some(10),
                    change_value: None,
                    price_change_percent: 2.0,
                },
            ],
            sampled_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_ranking_message_covers_all_kinds() {
        let text = format_ranking_message(&newcomer_set());
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "XUSDT entered the gainer board at #3 (+12.40%)");
        assert_eq!(lines[1], "YUSDT climbed 7 places to #2 (+8.10%)");
        assert_eq!(lines[2], "ZUSDT left the gainer board");
    }

    #[tokio::test]
    async fn test_ranking_notify_loop_sends_silent() {
        let sink = Arc::new(MemorySink::new());
        let (rank_tx, rank_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(ranking_notify_loop(
            rank_rx,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
            "movers-channel".to_string(),
            shutdown_rx,
        ));

        rank_tx.send(newcomer_set()).unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while sink.sent().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "ranking notification never sent");

        let sent = sink.sent();
        assert_eq!(sent[0].destination, "movers-channel");
        assert!(sent[0].options.silent, "ranking updates are silent");

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("notifier did not stop")
            .unwrap();
    }

    fn monitor_under_test() -> MarketMonitor {
        let rules = vec![AlertRule {
            id: Symbol::new("r1"),
            user_id: Symbol::new("chat-1"),
            symbol: None,
            timeframe: Timeframe::Min5,
            direction: AlertDirection::Both,
            threshold_percent: 5.0,
            enabled: true,
        }];
        MarketMonitor::new(
            MonitorConfig::default(),
            Arc::new(StaticSymbolFilter::allow_all()),
            Arc::new(ScriptedApi::new(Vec::new())),
            Arc::new(StaticRuleStore::new(rules)),
            Arc::new(MemorySink::new()),
        )
    }

    #[tokio::test]
    async fn test_on_price_update_gates_on_filter_and_dispatches() {
        let sink = Arc::new(MemorySink::new());
        let rules = vec![AlertRule {
            id: Symbol::new("r1"),
            user_id: Symbol::new("chat-1"),
            symbol: None,
            timeframe: Timeframe::Min5,
            direction: AlertDirection::Both,
            threshold_percent: 5.0,
            enabled: true,
        }];
        let monitor = MarketMonitor::new(
            MonitorConfig::default(),
            Arc::new(StaticSymbolFilter::deny(["SCAMUSDT"])),
            Arc::new(ScriptedApi::new(Vec::new())),
            Arc::new(StaticRuleStore::new(rules)),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );
        monitor.reload_rules().await.unwrap();

        monitor.on_price_update("SCAMUSDT", 1.0, 1e9).await;
        monitor.on_price_update("BTCUSDT", 100.0, 1e9).await;
        monitor.on_price_update("BTCUSDT", 110.0, 1e9).await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1, "one crossing, one notification");
        assert!(
            sent[0].text.contains("+10.00% in 5m"),
            "message was: {}",
            sent[0].text
        );
    }

    #[tokio::test]
    async fn test_query_surface_reads_cache_state() {
        let monitor = monitor_under_test();
        monitor.cache.write().ingest(vec![
            ticker("BTCUSDT", 50_000.0, 4.0, 2e8),
            ticker("ETHUSDT", 3_000.0, -2.0, 1e8),
        ]);

        let gainers = monitor.top_gainers(5);
        assert_eq!(gainers.len(), 1);
        assert_eq!(gainers[0].symbol, "BTCUSDT");

        let losers = monitor.top_losers(5);
        assert_eq!(losers.len(), 1);
        assert_eq!(losers[0].symbol, "ETHUSDT");

        assert!(monitor.ticker("BTCUSDT").is_some());
        assert!(monitor.ticker("NOPEUSDT").is_none());
        assert_eq!(monitor.batch_tickers(&["BTCUSDT", "ETHUSDT"]).len(), 2);

        assert_eq!(monitor.reload_rules().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_snapshot_serializes() {
        let monitor = monitor_under_test();
        monitor
            .cache
            .write()
            .ingest(vec![ticker("BTCUSDT", 50_000.0, 4.0, 2e8)]);

        let stats = monitor.stats().await;
        assert_eq!(stats.feed_state, FeedState::Disconnected);
        assert_eq!(stats.symbols_tracked, 1);
        assert_eq!(stats.batches_ingested, 1);

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains(r#""feed_state":"disconnected""#), "json was: {json}");
        assert!(json.contains(r#""symbols_tracked":1"#), "json was: {json}");
    }
}
