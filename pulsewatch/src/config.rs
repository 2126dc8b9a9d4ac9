//! Configuration for every monitor component.
//!
//! Each component takes its own config struct with sensible defaults and
//! builder-style overrides. `MonitorConfig::from_env` applies the environment
//! overrides used in deployment.

use std::time::Duration;

use crate::tier::{DataType, VolumeTierKind};

/// Streaming feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Combined-stream WebSocket endpoint
    pub url: String,
    /// Heartbeat ping interval
    pub heartbeat_interval: Duration,
    /// Connection fault is declared when no frame (pong included) arrives
    /// within this deadline
    pub heartbeat_deadline: Duration,
    /// Base reconnect delay, doubled per consecutive failed attempt
    pub base_backoff: Duration,
    /// Upper bound applied to the computed backoff delay
    pub max_backoff: Duration,
    /// Consecutive failed attempts tolerated before the feed reports
    /// persistent disconnection
    pub max_reconnect_attempts: u32,
    /// Buffer size of the driver command channel
    pub command_buffer_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://fstream.binance.com/stream".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_deadline: Duration::from_secs(120),
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            max_reconnect_attempts: 10,
            command_buffer_size: 64,
        }
    }
}

impl FeedConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set heartbeat ping interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set heartbeat silence deadline
    pub fn with_heartbeat_deadline(mut self, deadline: Duration) -> Self {
        self.heartbeat_deadline = deadline;
        self
    }

    /// Set base reconnect backoff
    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    /// Set maximum reconnect backoff
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set maximum consecutive reconnect attempts
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Backoff delay for the given zero-based attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Market state cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Rankings are resampled every Nth ingested batch
    pub sampling_cadence: u32,
    /// Depth of the sampled gainer ranking (never below 10)
    pub top_depth: usize,
    /// Percent change a ranking newcomer must carry to be significant
    pub min_gain_percent: f64,
    /// Absolute position delta that counts as a major ranking move
    pub major_move_threshold: usize,
    /// 24h quote volume floor applied when sampling rankings
    pub min_ranking_volume: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sampling_cadence: 5,
            top_depth: 10,
            min_gain_percent: 10.0,
            major_move_threshold: 3,
            min_ranking_volume: 1_000_000.0,
        }
    }
}

impl CacheConfig {
    /// Set ranking sampling cadence in ingested batches
    pub fn with_sampling_cadence(mut self, cadence: u32) -> Self {
        self.sampling_cadence = cadence.max(1);
        self
    }

    /// Set ranking depth; values below 10 are raised to 10
    pub fn with_top_depth(mut self, depth: usize) -> Self {
        self.top_depth = depth.max(10);
        self
    }

    /// Set newcomer significance threshold in percent
    pub fn with_min_gain_percent(mut self, percent: f64) -> Self {
        self.min_gain_percent = percent;
        self
    }

    /// Set major move position threshold
    pub fn with_major_move_threshold(mut self, positions: usize) -> Self {
        self.major_move_threshold = positions;
        self
    }

    /// Set ranking volume floor
    pub fn with_min_ranking_volume(mut self, volume: f64) -> Self {
        self.min_ranking_volume = volume;
        self
    }
}

/// Cooldown key scope for the alert engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CooldownScope {
    /// One cooldown per (symbol, timeframe), shared by overlapping rules
    #[default]
    SymbolTimeframe,
    /// One cooldown per (symbol, timeframe, rule)
    PerRule,
}

/// Alert engine configuration.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Minimum spacing between notifications sharing a cooldown key
    pub cooldown: Duration,
    /// Cooldown key scope
    pub cooldown_scope: CooldownScope,
    /// Absolute percent change below which evaluation is noise
    pub noise_floor_percent: f64,
    /// Cooldown records older than this are garbage collected
    pub cooldown_retention: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            cooldown_scope: CooldownScope::SymbolTimeframe,
            noise_floor_percent: 0.1,
            cooldown_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AlertConfig {
    /// Set cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set cooldown key scope
    pub fn with_cooldown_scope(mut self, scope: CooldownScope) -> Self {
        self.cooldown_scope = scope;
        self
    }

    /// Set cooldown record retention
    pub fn with_cooldown_retention(mut self, retention: Duration) -> Self {
        self.cooldown_retention = retention;
        self
    }
}

/// Refresh intervals for one volume tier, one per REST data type.
#[derive(Debug, Clone, Copy)]
pub struct TierIntervals {
    pub ticker: Duration,
    pub funding: Duration,
    pub open_interest: Duration,
}

impl TierIntervals {
    pub fn interval(&self, data_type: DataType) -> Duration {
        match data_type {
            DataType::Ticker => self.ticker,
            DataType::Funding => self.funding,
            DataType::OpenInterest => self.open_interest,
        }
    }
}

/// Volume tier scheduler configuration.
///
/// Intervals are monotonically non-decreasing from high to low tier for every
/// data type.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// 24h quote volume at or above which a symbol is high tier
    pub high_volume_floor: f64,
    /// 24h quote volume at or above which a symbol is medium tier
    pub medium_volume_floor: f64,
    /// Refresh intervals for high tier symbols
    pub high: TierIntervals,
    /// Refresh intervals for medium tier symbols
    pub medium: TierIntervals,
    /// Refresh intervals for low tier symbols
    pub low: TierIntervals,
    /// Maximum symbols handed out per `due_for_refresh` call
    pub fetch_budget: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            high_volume_floor: 100_000_000.0,
            medium_volume_floor: 10_000_000.0,
            high: TierIntervals {
                ticker: Duration::from_secs(60),
                funding: Duration::from_secs(300),
                open_interest: Duration::from_secs(300),
            },
            medium: TierIntervals {
                ticker: Duration::from_secs(300),
                funding: Duration::from_secs(900),
                open_interest: Duration::from_secs(900),
            },
            low: TierIntervals {
                ticker: Duration::from_secs(1800),
                funding: Duration::from_secs(1800),
                open_interest: Duration::from_secs(1800),
            },
            fetch_budget: 30,
        }
    }
}

impl TierConfig {
    /// Set tier volume floors
    pub fn with_volume_floors(mut self, high: f64, medium: f64) -> Self {
        self.high_volume_floor = high;
        self.medium_volume_floor = medium;
        self
    }

    /// Set per-call fetch budget
    pub fn with_fetch_budget(mut self, budget: usize) -> Self {
        self.fetch_budget = budget.max(1);
        self
    }

    /// Refresh interval for the given tier and data type.
    pub fn interval(&self, tier: VolumeTierKind, data_type: DataType) -> Duration {
        match tier {
            VolumeTierKind::High => self.high.interval(data_type),
            VolumeTierKind::Medium => self.medium.interval(data_type),
            VolumeTierKind::Low => self.low.interval(data_type),
        }
    }
}

/// Top-level monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub feed: FeedConfig,
    pub cache: CacheConfig,
    pub alert: AlertConfig,
    pub tier: TierConfig,
    /// Cadence of the REST refresh driver
    pub refresh_tick: Duration,
    /// Cadence of tier reclassification
    pub classify_interval: Duration,
    /// Cadence of cooldown garbage collection
    pub sweep_interval: Duration,
    /// Cadence of the periodic stats log line
    pub stats_interval: Duration,
    /// Destination for ranking change notifications, None disables them
    pub ranking_channel: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            cache: CacheConfig::default(),
            alert: AlertConfig::default(),
            tier: TierConfig::default(),
            refresh_tick: Duration::from_secs(10),
            classify_interval: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(300),
            stats_interval: Duration::from_secs(60),
            ranking_channel: None,
        }
    }
}

impl MonitorConfig {
    /// Build the deployment configuration: defaults overridden by
    /// `PULSEWATCH_*` environment variables where set.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("PULSEWATCH_WS_URL") {
            config.feed.url = url;
        }
        config.feed.max_reconnect_attempts = env_parse(
            "PULSEWATCH_MAX_RECONNECT_ATTEMPTS",
            config.feed.max_reconnect_attempts,
        );
        config.cache.sampling_cadence = env_parse(
            "PULSEWATCH_SAMPLING_CADENCE",
            config.cache.sampling_cadence,
        )
        .max(1);
        config.cache.top_depth =
            env_parse("PULSEWATCH_TOP_DEPTH", config.cache.top_depth).max(10);
        config.cache.min_gain_percent =
            env_parse("PULSEWATCH_MIN_GAIN_PCT", config.cache.min_gain_percent);
        config.cache.major_move_threshold = env_parse(
            "PULSEWATCH_MAJOR_MOVE_THRESHOLD",
            config.cache.major_move_threshold,
        );
        config.alert.cooldown = Duration::from_secs(env_parse(
            "PULSEWATCH_COOLDOWN_SECS",
            config.alert.cooldown.as_secs(),
        ));
        config.refresh_tick = Duration::from_secs(env_parse(
            "PULSEWATCH_REFRESH_TICK_SECS",
            config.refresh_tick.as_secs(),
        ));
        if let Ok(channel) = std::env::var("PULSEWATCH_RANKING_CHANNEL") {
            config.ranking_channel = Some(channel);
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
