use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `pulsewatch`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Error)]
pub enum MonitorError {
    #[error("connection failure: {0}")]
    Connection(String),

    #[error("reconnect limit exceeded after {attempts} attempts")]
    ReconnectLimitExceeded { attempts: u32 },

    #[error("subscription failure: {0}")]
    Subscription(String),

    #[error("record failed validation: {0}")]
    Validation(String),

    #[error("http request failure: {0}")]
    Http(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("notification dispatch failure: {0}")]
    Notification(String),

    #[error("invalid url: {0}")]
    Url(String),
}

impl MonitorError {
    /// Determine if an error ends the reconnect loop rather than scheduling
    /// another backoff attempt.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            MonitorError::ReconnectLimitExceeded { .. } => true,
            MonitorError::Url(_) => true,
            MonitorError::Connection(error_msg) => {
                // Handshake rejections will not succeed on retry
                // Use case-insensitive matching for robustness
                let error_lower = error_msg.to_lowercase();
                error_lower.contains("unauthorized")
                    || error_lower.contains("forbidden")
                    || error_lower.contains("invalid uri")
                    || error_lower.contains("unsupported url scheme")
            }
            _ => false,
        }
    }

    /// Determine if an error came back from a REST rate limiter, in which case
    /// the affected symbol is counted as skipped and the batch continues.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, MonitorError::RateLimited(_))
    }
}

impl From<url::ParseError> for MonitorError {
    fn from(value: url::ParseError) -> Self {
        Self::Url(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(value.to_string())
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(value: serde_json::Error) -> Self {
        Self::Validation(value.to_string())
    }
}

/// Reasons a rule evaluation produced no notification.
///
/// Skips are normal control flow and are logged at debug level only, never as
/// errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub enum SkipReason {
    /// Fewer than two snapshots in the window.
    InsufficientHistory,
    /// Absolute change below the fixed noise floor.
    NoiseFloor,
    /// Change direction does not satisfy the rule direction.
    Direction,
    /// Absolute change below the rule threshold.
    BelowThreshold,
    /// A prior trigger within the cooldown window suppressed dispatch.
    CooldownActive,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InsufficientHistory => "insufficient_history",
            SkipReason::NoiseFloor => "noise_floor",
            SkipReason::Direction => "direction",
            SkipReason::BelowThreshold => "below_threshold",
            SkipReason::CooldownActive => "cooldown_active",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
