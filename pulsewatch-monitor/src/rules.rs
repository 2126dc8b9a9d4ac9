use std::path::PathBuf;

use async_trait::async_trait;
use pulsewatch::{
    alert::rule::{AlertRule, AlertRuleStore, TriggerRecord},
    error::MonitorError,
};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Rule store backed by flat files.
///
/// Rules are read from a JSON array on every reload so edits land without a
/// restart. Triggers are appended to a JSON-lines history file.
pub struct JsonRuleStore {
    rules_path: PathBuf,
    history_path: PathBuf,
}

impl JsonRuleStore {
    pub fn new(rules_path: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            rules_path: rules_path.into(),
            history_path: history_path.into(),
        }
    }

    pub fn from_env() -> Self {
        let rules_path = std::env::var("PULSEWATCH_RULES_PATH")
            .unwrap_or_else(|_| "alert_rules.json".to_string());
        let history_path = std::env::var("PULSEWATCH_TRIGGER_HISTORY_PATH")
            .unwrap_or_else(|_| "alert_triggers.jsonl".to_string());
        Self::new(rules_path, history_path)
    }
}

#[async_trait]
impl AlertRuleStore for JsonRuleStore {
    async fn load_enabled_alerts(&self) -> Result<Vec<AlertRule>, MonitorError> {
        let raw = match tokio::fs::read_to_string(&self.rules_path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.rules_path.display(), "rules file missing, loading no rules");
                return Ok(Vec::new());
            }
            Err(error) => return Err(MonitorError::Persistence(error.to_string())),
        };

        let rules = serde_json::from_str::<Vec<AlertRule>>(&raw)
            .map_err(|error| MonitorError::Persistence(error.to_string()))?;

        let enabled: Vec<AlertRule> = rules.into_iter().filter(|rule| rule.enabled).collect();
        debug!(
            path = %self.rules_path.display(),
            count = enabled.len(),
            "loaded enabled rules"
        );
        Ok(enabled)
    }

    async fn record_trigger(&self, record: &TriggerRecord) -> Result<(), MonitorError> {
        let mut line = serde_json::to_string(record)
            .map_err(|error| MonitorError::Persistence(error.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .await
            .map_err(|error| MonitorError::Persistence(error.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|error| MonitorError::Persistence(error.to_string()))?;
        Ok(())
    }
}
