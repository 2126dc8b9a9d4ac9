use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use tracing::{debug, info, warn};
use vecmap::VecMap;

use crate::{
    config::{AlertConfig, CooldownScope},
    error::{MonitorError, SkipReason},
    market::{PriceSnapshot, Symbol},
    notify::{NotificationOptions, NotificationSink},
};

use self::{
    rule::{AlertRule, AlertRuleStore, TriggerRecord},
    timeframe::{Timeframe, TimeframeWindow, WindowMeasure},
};

pub mod rule;
pub mod timeframe;

/// Key a trigger's cooldown is recorded under.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct CooldownKey {
    symbol: Symbol,
    timeframe: Timeframe,
    /// Populated only under [`CooldownScope::PerRule`]
    rule_id: Option<Symbol>,
}

/// Engine-local record of the last dispatched trigger for a cooldown key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooldownRecord {
    /// Percent change that fired the trigger
    pub last_trigger_value: f64,
    /// Price at trigger time
    pub last_price: f64,
    /// Trigger time
    pub last_trigger_time: DateTime<Utc>,
}

/// A rule evaluation that passed every gate and is ready for dispatch.
#[derive(Debug, Clone)]
struct AlertTrigger {
    rule: AlertRule,
    symbol: Symbol,
    change_percent: f64,
    price: f64,
    time: DateTime<Utc>,
}

/// Multi-timeframe threshold alerting engine.
///
/// Every price update is appended to all eight timeframe windows, then every
/// enabled rule matching the symbol is evaluated against its window. A
/// cooldown map guarantees at most one notification per cooldown key within
/// the cooldown duration.
pub struct AlertEngine {
    config: AlertConfig,
    cooldown: ChronoDuration,
    retention: ChronoDuration,
    windows: VecMap<Timeframe, TimeframeWindow>,
    rules: Vec<AlertRule>,
    cooldowns: FnvHashMap<CooldownKey, CooldownRecord>,
    store: Arc<dyn AlertRuleStore>,
    notifier: Arc<dyn NotificationSink>,
    triggered: u64,
    suppressed: u64,
}

impl AlertEngine {
    pub fn new(
        config: AlertConfig,
        store: Arc<dyn AlertRuleStore>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let mut windows = VecMap::with_capacity(Timeframe::ALL.len());
        for timeframe in Timeframe::ALL {
            windows.insert(timeframe, TimeframeWindow::new(timeframe));
        }

        let cooldown =
            ChronoDuration::from_std(config.cooldown).unwrap_or(ChronoDuration::MAX);
        let retention = ChronoDuration::from_std(config.cooldown_retention)
            .unwrap_or(ChronoDuration::MAX);

        Self {
            config,
            cooldown,
            retention,
            windows,
            rules: Vec::new(),
            cooldowns: FnvHashMap::default(),
            store,
            notifier,
            triggered: 0,
            suppressed: 0,
        }
    }

    /// Replace the cached rule copy from the store.
    ///
    /// On store failure the previous copy stays in effect.
    pub async fn reload_rules(&mut self) -> Result<usize, MonitorError> {
        match self.store.load_enabled_alerts().await {
            Ok(rules) => {
                info!(count = rules.len(), "alert rules loaded");
                self.rules = rules;
                Ok(self.rules.len())
            }
            Err(err) => {
                warn!(%err, kept = self.rules.len(), "rule reload failed, keeping cached rules");
                Err(err)
            }
        }
    }

    /// Record a price observation and evaluate every matching rule.
    ///
    /// Never raises: dispatch and persistence failures are logged and the
    /// update completes.
    pub async fn on_price_update(
        &mut self,
        symbol: &str,
        price: f64,
        volume24h: f64,
        time: DateTime<Utc>,
    ) {
        let symbol = Symbol::new(symbol);
        let snapshot = PriceSnapshot {
            price,
            timestamp: time,
            volume24h,
        };
        for window in self.windows.values_mut() {
            window.push(&symbol, snapshot);
        }

        let mut candidates = Vec::new();
        for rule in &self.rules {
            if !rule.enabled || !rule.matches_symbol(&symbol) {
                continue;
            }
            let Some(window) = self.windows.get(&rule.timeframe) else {
                continue;
            };
            match Self::evaluate(window, rule, &symbol, time, self.config.noise_floor_percent) {
                Ok(trigger) => candidates.push(trigger),
                Err(skip) => {
                    debug!(
                        symbol = %symbol,
                        rule = %rule.id,
                        timeframe = %rule.timeframe,
                        reason = %skip,
                        "rule evaluation skipped"
                    );
                }
            }
        }

        for trigger in candidates {
            self.dispatch(trigger).await;
        }
    }

    /// Evaluate one rule against its window measurement.
    fn evaluate(
        window: &TimeframeWindow,
        rule: &AlertRule,
        symbol: &Symbol,
        now: DateTime<Utc>,
        noise_floor_percent: f64,
    ) -> Result<AlertTrigger, SkipReason> {
        let WindowMeasure {
            change_percent,
            current_price,
            ..
        } = window
            .measure(symbol, now)
            .ok_or(SkipReason::InsufficientHistory)?;

        if change_percent.abs() < noise_floor_percent {
            return Err(SkipReason::NoiseFloor);
        }
        if !rule.direction.accepts(change_percent) {
            return Err(SkipReason::Direction);
        }
        if change_percent.abs() < rule.threshold_percent {
            return Err(SkipReason::BelowThreshold);
        }

        Ok(AlertTrigger {
            rule: rule.clone(),
            symbol: symbol.clone(),
            change_percent,
            price: current_price,
            time: now,
        })
    }

    /// Dispatch one trigger unless its cooldown key is still hot.
    async fn dispatch(&mut self, trigger: AlertTrigger) {
        let key = self.cooldown_key(&trigger);
        if let Some(record) = self.cooldowns.get(&key) {
            if trigger.time - record.last_trigger_time < self.cooldown {
                debug!(
                    symbol = %trigger.symbol,
                    timeframe = %trigger.rule.timeframe,
                    rule = %trigger.rule.id,
                    reason = %SkipReason::CooldownActive,
                    "rule evaluation skipped"
                );
                self.suppressed += 1;
                return;
            }
        }

        self.cooldowns.insert(
            key,
            CooldownRecord {
                last_trigger_value: trigger.change_percent,
                last_price: trigger.price,
                last_trigger_time: trigger.time,
            },
        );
        self.triggered += 1;

        let text = Self::format_message(&trigger);
        info!(
            symbol = %trigger.symbol,
            timeframe = %trigger.rule.timeframe,
            change_percent = trigger.change_percent,
            "alert triggered"
        );

        if let Err(err) = self
            .notifier
            .send(&trigger.rule.user_id, &text, &NotificationOptions::default())
            .await
        {
            warn!(%err, rule = %trigger.rule.id, "notification dispatch failed");
        }

        let record = TriggerRecord {
            rule_id: trigger.rule.id.clone(),
            user_id: trigger.rule.user_id.clone(),
            symbol: trigger.symbol.clone(),
            timeframe: trigger.rule.timeframe,
            change_percent: trigger.change_percent,
            price: trigger.price,
            triggered_at: trigger.time,
        };
        if let Err(err) = self.store.record_trigger(&record).await {
            warn!(%err, rule = %trigger.rule.id, "trigger history write failed");
        }
    }

    fn cooldown_key(&self, trigger: &AlertTrigger) -> CooldownKey {
        CooldownKey {
            symbol: trigger.symbol.clone(),
            timeframe: trigger.rule.timeframe,
            rule_id: match self.config.cooldown_scope {
                CooldownScope::SymbolTimeframe => None,
                CooldownScope::PerRule => Some(trigger.rule.id.clone()),
            },
        }
    }

    fn format_message(trigger: &AlertTrigger) -> String {
        format!(
            "{} {:+.2}% in {} | price {} | rule {} ({}%)",
            trigger.symbol,
            trigger.change_percent,
            trigger.rule.timeframe,
            trigger.price,
            trigger.rule.id,
            trigger.rule.threshold_percent,
        )
    }

    /// Drop expired cooldown records and reclaim idle window symbols.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let before = self.cooldowns.len();
        let retention = self.retention;
        self.cooldowns
            .retain(|_, record| now - record.last_trigger_time < retention);
        let removed = before - self.cooldowns.len();

        for window in self.windows.values_mut() {
            window.prune_idle(now);
        }

        if removed > 0 {
            debug!(removed, remaining = self.cooldowns.len(), "cooldown records swept");
        }
    }

    /// Number of rules in the cached copy.
    pub fn rules_loaded(&self) -> usize {
        self.rules.len()
    }

    /// Cooldown records currently held.
    pub fn active_cooldowns(&self) -> usize {
        self.cooldowns.len()
    }

    /// Notifications dispatched since construction.
    pub fn triggered_total(&self) -> u64 {
        self.triggered
    }

    /// Triggers suppressed by cooldown since construction.
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed
    }

    /// Snapshot counts per timeframe window.
    pub fn window_depths(&self) -> Vec<(Timeframe, usize)> {
        self.windows
            .iter()
            .map(|(timeframe, window)| (*timeframe, window.snapshot_count()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::rule::{AlertDirection, StaticRuleStore};
    use crate::notify::MemorySink;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use smol_str::SmolStr;

    fn rule(
        id: &str,
        symbol: Option<&str>,
        timeframe: Timeframe,
        direction: AlertDirection,
        threshold_percent: f64,
    ) -> AlertRule {
        AlertRule {
            id: SmolStr::new(id),
            user_id: SmolStr::new("chat-1"),
            symbol: symbol.map(SmolStr::new),
            timeframe,
            direction,
            threshold_percent,
            enabled: true,
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 9, 12, 0, 0).unwrap()
    }

    async fn engine_with(
        config: AlertConfig,
        rules: Vec<AlertRule>,
    ) -> (AlertEngine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut engine = AlertEngine::new(
            config,
            Arc::new(StaticRuleStore::new(rules)),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );
        engine.reload_rules().await.unwrap();
        (engine, sink)
    }

    #[tokio::test]
    async fn test_gain_rule_triggers_with_change_percent() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let (mut engine, sink) = engine_with(AlertConfig::default(), rules).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        assert!(sink.sent().is_empty(), "single snapshot cannot trigger");

        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "chat-1");
        assert!(
            sent[0].text.contains("+10.00% in 1m"),
            "message was: {}",
            sent[0].text
        );
        assert_eq!(engine.triggered_total(), 1);
        assert_eq!(engine.active_cooldowns(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_within_window() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let config = AlertConfig::default().with_cooldown(std::time::Duration::from_secs(60));
        let (mut engine, sink) = engine_with(config, rules).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;
        assert_eq!(sink.sent().len(), 1);

        // 10s after the first trigger: still qualifying, still cooling down
        engine
            .on_price_update("BTCUSDT", 111.0, 1e9, t0 + ChronoDuration::seconds(40))
            .await;
        assert_eq!(sink.sent().len(), 1, "no second notification within cooldown");
        assert_eq!(engine.suppressed_total(), 1);

        // Past the cooldown a fresh qualifying move fires again
        engine
            .on_price_update("BTCUSDT", 125.0, 1e9, t0 + ChronoDuration::seconds(95))
            .await;
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_noise_floor_skips_tiny_moves() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Both, 0.01)];
        let (mut engine, sink) = engine_with(AlertConfig::default(), rules).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 100.05, 1e9, t0 + ChronoDuration::seconds(30))
            .await;

        assert!(sink.sent().is_empty(), "0.05% sits under the 0.1% noise floor");
    }

    #[tokio::test]
    async fn test_direction_mismatch_does_not_trigger() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Loss, 5.0)];
        let (mut engine, sink) = engine_with(AlertConfig::default(), rules).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;

        assert!(sink.sent().is_empty(), "gain move must not fire a loss rule");
    }

    #[tokio::test]
    async fn test_loss_rule_triggers_on_drop() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min5, AlertDirection::Loss, 5.0)];
        let (mut engine, sink) = engine_with(AlertConfig::default(), rules).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 93.0, 1e9, t0 + ChronoDuration::seconds(60))
            .await;

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].text.contains("-7.00% in 5m"), "message was: {}", sent[0].text);
    }

    #[tokio::test]
    async fn test_shared_cooldown_across_rules_by_default() {
        // Two rules on the same (symbol, timeframe): default scope allows only
        // the first to deliver
        let rules = vec![
            rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0),
            rule("r2", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Both, 4.0),
        ];
        let (mut engine, sink) = engine_with(AlertConfig::default(), rules.clone()).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;
        assert_eq!(sink.sent().len(), 1);
        assert_eq!(engine.suppressed_total(), 1);

        // Per-rule scope keys cooldowns independently
        let config = AlertConfig::default().with_cooldown_scope(CooldownScope::PerRule);
        let (mut engine, sink) = engine_with(config, rules).await;
        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;
        assert_eq!(sink.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_wildcard_rule_watches_every_symbol() {
        let rules = vec![rule("r1", None, Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let (mut engine, sink) = engine_with(AlertConfig::default(), rules).await;
        let t0 = base_time();

        engine.on_price_update("AUSDT", 1.0, 1e6, t0).await;
        engine.on_price_update("BUSDT", 2.0, 1e6, t0).await;
        engine
            .on_price_update("AUSDT", 1.1, 1e6, t0 + ChronoDuration::seconds(20))
            .await;
        engine
            .on_price_update("BUSDT", 2.4, 1e6, t0 + ChronoDuration::seconds(25))
            .await;

        assert_eq!(sink.sent().len(), 2, "independent symbols alert independently");
    }

    #[tokio::test]
    async fn test_sweep_expires_cooldowns() {
        let config = AlertConfig::default()
            .with_cooldown_retention(std::time::Duration::from_secs(3600));
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let (mut engine, _sink) = engine_with(config, rules).await;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;
        assert_eq!(engine.active_cooldowns(), 1);

        engine.sweep(t0 + ChronoDuration::seconds(1800));
        assert_eq!(engine.active_cooldowns(), 1, "retention not yet reached");

        engine.sweep(t0 + ChronoDuration::seconds(3700));
        assert_eq!(engine.active_cooldowns(), 0);
    }

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn send(
            &self,
            _destination: &str,
            _text: &str,
            _options: &NotificationOptions,
        ) -> Result<(), MonitorError> {
            Err(MonitorError::Notification("gateway unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_swallowed_and_not_retried() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let mut engine = AlertEngine::new(
            AlertConfig::default(),
            Arc::new(StaticRuleStore::new(rules)),
            Arc::new(FailingSink),
        );
        engine.reload_rules().await.unwrap();
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;

        // The trigger burned its cooldown even though delivery failed
        assert_eq!(engine.triggered_total(), 1);
        assert_eq!(engine.active_cooldowns(), 1);

        engine
            .on_price_update("BTCUSDT", 111.0, 1e9, t0 + ChronoDuration::seconds(40))
            .await;
        assert_eq!(engine.triggered_total(), 1, "failed dispatch is not retried");
    }

    struct FailingStore;

    #[async_trait]
    impl rule::AlertRuleStore for FailingStore {
        async fn load_enabled_alerts(&self) -> Result<Vec<AlertRule>, MonitorError> {
            Err(MonitorError::Persistence("store offline".to_string()))
        }

        async fn record_trigger(&self, _record: &TriggerRecord) -> Result<(), MonitorError> {
            Err(MonitorError::Persistence("store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_cached_rules() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let sink = Arc::new(MemorySink::new());
        let mut engine = AlertEngine::new(
            AlertConfig::default(),
            Arc::new(StaticRuleStore::new(rules)),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );
        engine.reload_rules().await.unwrap();
        assert_eq!(engine.rules_loaded(), 1);

        engine.store = Arc::new(FailingStore);
        assert!(engine.reload_rules().await.is_err());
        assert_eq!(engine.rules_loaded(), 1, "previous copy stays in effect");
    }

    #[tokio::test]
    async fn test_persistence_failure_never_blocks_delivery() {
        let rules = vec![rule("r1", Some("BTCUSDT"), Timeframe::Min1, AlertDirection::Gain, 5.0)];
        let sink = Arc::new(MemorySink::new());
        let mut engine = AlertEngine::new(
            AlertConfig::default(),
            Arc::new(FailingStore),
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        );
        engine.rules = rules;
        let t0 = base_time();

        engine.on_price_update("BTCUSDT", 100.0, 1e9, t0).await;
        engine
            .on_price_update("BTCUSDT", 110.0, 1e9, t0 + ChronoDuration::seconds(30))
            .await;

        assert_eq!(sink.sent().len(), 1, "notification delivered despite audit failure");
    }
}
