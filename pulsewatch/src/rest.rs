use async_trait::async_trait;

use crate::error::MonitorError;
use crate::market::{FundingSnapshot, OpenInterestStat, TickerSnapshot};

/// Venue REST endpoints backing the scheduled refresh cycle.
///
/// The live implementation talks to the exchange HTTP API. Tests use
/// scripted in-memory implementations. Rate limiting surfaces as
/// [`MonitorError::RateLimited`] so the scheduler can skip the symbol
/// and retry on the next cycle.
#[async_trait]
pub trait MarketDataApi: Send + Sync {
    /// Rolling 24h statistics for every instrument, one batched call.
    async fn day_stats_all(&self) -> Result<Vec<TickerSnapshot>, MonitorError>;

    /// Current funding rate and mark pricing for one instrument.
    async fn funding_rate(&self, symbol: &str) -> Result<FundingSnapshot, MonitorError>;

    /// Recent open interest history for one instrument.
    ///
    /// `period` is a venue interval label such as "5m", newest entries last.
    async fn open_interest(
        &self,
        symbol: &str,
        period: &str,
        limit: usize,
    ) -> Result<Vec<OpenInterestStat>, MonitorError>;
}
