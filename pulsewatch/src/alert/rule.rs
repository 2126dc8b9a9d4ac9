use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{alert::timeframe::Timeframe, error::MonitorError, market::Symbol};

/// Direction of price movement a rule fires on.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertDirection {
    Gain,
    Loss,
    Both,
}

impl AlertDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertDirection::Gain => "gain",
            AlertDirection::Loss => "loss",
            AlertDirection::Both => "both",
        }
    }

    /// Whether the sign of `change_percent` satisfies this direction.
    pub fn accepts(&self, change_percent: f64) -> bool {
        match self {
            AlertDirection::Gain => change_percent > 0.0,
            AlertDirection::Loss => change_percent < 0.0,
            AlertDirection::Both => true,
        }
    }
}

impl std::fmt::Display for AlertDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-defined threshold rule evaluated on every matching price update.
///
/// Rules are owned by the external store; the engine holds a read-mostly
/// cached copy refreshed via explicit reload. Cooldown bookkeeping lives in
/// the engine and is never part of the rule.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AlertRule {
    /// Store-assigned rule identifier
    pub id: Symbol,
    /// Owner, doubling as the notification destination
    pub user_id: Symbol,
    /// Symbol the rule watches; `None` watches every eligible symbol
    #[serde(default)]
    pub symbol: Option<Symbol>,
    /// Timeframe window the rule evaluates against
    pub timeframe: Timeframe,
    /// Movement direction the rule fires on
    pub direction: AlertDirection,
    /// Minimum absolute percent change to fire
    pub threshold_percent: f64,
    /// Disabled rules are never evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    /// Whether this rule applies to `symbol`.
    pub fn matches_symbol(&self, symbol: &str) -> bool {
        match &self.symbol {
            Some(watched) => watched == symbol,
            None => true,
        }
    }
}

/// Audit record of one dispatched notification.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TriggerRecord {
    pub rule_id: Symbol,
    pub user_id: Symbol,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub change_percent: f64,
    pub price: f64,
    pub triggered_at: DateTime<Utc>,
}

/// External owner of alert rules and trigger history.
#[async_trait]
pub trait AlertRuleStore: Send + Sync {
    /// Load every enabled rule.
    async fn load_enabled_alerts(&self) -> Result<Vec<AlertRule>, MonitorError>;

    /// Append a trigger to the audit history. Best effort: failures are
    /// logged by the engine and never block delivery.
    async fn record_trigger(&self, record: &TriggerRecord) -> Result<(), MonitorError>;
}

/// Fixed in-memory rule store for tests and static deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticRuleStore {
    rules: Vec<AlertRule>,
}

impl StaticRuleStore {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self { rules }
    }
}

#[async_trait]
impl AlertRuleStore for StaticRuleStore {
    async fn load_enabled_alerts(&self) -> Result<Vec<AlertRule>, MonitorError> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| rule.enabled)
            .cloned()
            .collect())
    }

    async fn record_trigger(&self, _record: &TriggerRecord) -> Result<(), MonitorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol_str::SmolStr;

    #[test]
    fn test_direction_accepts_sign() {
        struct TestCase {
            direction: AlertDirection,
            change_percent: f64,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: gain accepts positive change
                direction: AlertDirection::Gain,
                change_percent: 5.0,
                expected: true,
            },
            TestCase {
                // TC1: gain rejects negative change
                direction: AlertDirection::Gain,
                change_percent: -5.0,
                expected: false,
            },
            TestCase {
                // TC2: loss accepts negative change
                direction: AlertDirection::Loss,
                change_percent: -5.0,
                expected: true,
            },
            TestCase {
                // TC3: loss rejects positive change
                direction: AlertDirection::Loss,
                change_percent: 5.0,
                expected: false,
            },
            TestCase {
                // TC4: both accepts either sign
                direction: AlertDirection::Both,
                change_percent: -5.0,
                expected: true,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.direction.accepts(test.change_percent);
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_rule_deserialization() {
        let input = r#"{
            "id": "r1",
            "user_id": "chat-42",
            "symbol": "BTCUSDT",
            "timeframe": "1m",
            "direction": "gain",
            "threshold_percent": 5.0
        }"#;

        let rule: AlertRule = serde_json::from_str(input).unwrap();
        assert_eq!(rule.id, "r1");
        assert_eq!(rule.timeframe, Timeframe::Min1);
        assert_eq!(rule.direction, AlertDirection::Gain);
        assert!(rule.enabled, "enabled defaults to true");
        assert!(rule.matches_symbol("BTCUSDT"));
        assert!(!rule.matches_symbol("ETHUSDT"));
    }

    #[test]
    fn test_wildcard_rule_matches_any_symbol() {
        let rule = AlertRule {
            id: SmolStr::new("r2"),
            user_id: SmolStr::new("chat-42"),
            symbol: None,
            timeframe: Timeframe::Hour1,
            direction: AlertDirection::Both,
            threshold_percent: 10.0,
            enabled: true,
        };

        assert!(rule.matches_symbol("BTCUSDT"));
        assert!(rule.matches_symbol("DOGEUSDT"));
    }

    #[tokio::test]
    async fn test_static_store_filters_disabled() {
        let enabled = AlertRule {
            id: SmolStr::new("on"),
            user_id: SmolStr::new("u"),
            symbol: None,
            timeframe: Timeframe::Min5,
            direction: AlertDirection::Gain,
            threshold_percent: 2.0,
            enabled: true,
        };
        let disabled = AlertRule {
            enabled: false,
            id: SmolStr::new("off"),
            ..enabled.clone()
        };

        let store = StaticRuleStore::new(vec![enabled, disabled]);
        let loaded = store.load_enabled_alerts().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "on");
    }
}
