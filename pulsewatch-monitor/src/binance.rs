use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulsewatch::{
    de,
    error::MonitorError,
    market::{FundingSnapshot, OpenInterestStat, TickerSnapshot},
    rest::MarketDataApi,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use smol_str::SmolStr;
use tracing::debug;

/// Production REST base for Binance USD-M futures.
const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// Typed client over the Binance USD-M futures REST API.
///
/// A single [`Client`] is shared across calls so connection pooling carries
/// over between refresh cycles.
pub struct BinanceFuturesApi {
    client: Client,
    base_url: String,
}

impl BinanceFuturesApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn from_env() -> Self {
        let base_url = std::env::var("PULSEWATCH_REST_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(base_url)
    }

    /// Fetch `path_and_query` and decode the JSON body.
    ///
    /// 429 and 418 responses map to [`MonitorError::RateLimited`] so refresh
    /// cycles defer their remaining symbols instead of hammering the limiter.
    async fn get_json<T>(&self, path_and_query: &str) -> Result<T, MonitorError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| MonitorError::Http(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
            return Err(MonitorError::RateLimited(format!("{status}: {url}")));
        }
        if let Err(error) = response.error_for_status_ref() {
            return Err(MonitorError::Http(error.to_string()));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| MonitorError::Validation(error.to_string()))
    }
}

/// 24hr rolling window ticker statistics record.
#[derive(Debug, Clone, Deserialize)]
struct BinanceDayStats {
    symbol: SmolStr,
    #[serde(rename = "lastPrice", deserialize_with = "de::de_str_f64")]
    last_price: f64,
    #[serde(rename = "priceChange", deserialize_with = "de::de_str_f64")]
    price_change: f64,
    #[serde(rename = "priceChangePercent", deserialize_with = "de::de_str_f64")]
    price_change_percent: f64,
    #[serde(rename = "quoteVolume", deserialize_with = "de::de_str_f64")]
    quote_volume: f64,
    #[serde(rename = "closeTime", deserialize_with = "de::de_u64_epoch_ms_as_datetime_utc")]
    close_time: DateTime<Utc>,
}

/// Premium index record carrying the current funding rate.
#[derive(Debug, Clone, Deserialize)]
struct BinancePremiumIndex {
    symbol: SmolStr,
    #[serde(rename = "lastFundingRate", deserialize_with = "de::de_str_f64")]
    last_funding_rate: f64,
    #[serde(rename = "indexPrice", default, deserialize_with = "de::de_opt_str_f64")]
    index_price: Option<f64>,
    #[serde(
        rename = "nextFundingTime",
        default,
        deserialize_with = "de::de_opt_u64_epoch_ms_as_datetime_utc"
    )]
    next_funding_time: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "de::de_u64_epoch_ms_as_datetime_utc")]
    time: DateTime<Utc>,
}

impl From<BinancePremiumIndex> for FundingSnapshot {
    fn from(record: BinancePremiumIndex) -> Self {
        Self {
            symbol: record.symbol,
            rate: record.last_funding_rate,
            index_price: record.index_price,
            // Delivery contracts report a zero placeholder here
            next_funding_time: record
                .next_funding_time
                .filter(|time| time.timestamp_millis() > 0),
            timestamp: record.time,
        }
    }
}

/// One `openInterestHist` bucket of exchange-aggregated sums.
#[derive(Debug, Clone, Deserialize)]
struct BinanceOpenInterestHist {
    symbol: SmolStr,
    #[serde(rename = "sumOpenInterest", deserialize_with = "de::de_str_f64")]
    sum_open_interest: f64,
    #[serde(
        rename = "sumOpenInterestValue",
        default,
        deserialize_with = "de::de_opt_str_f64"
    )]
    sum_open_interest_value: Option<f64>,
    #[serde(deserialize_with = "de::de_u64_epoch_ms_as_datetime_utc")]
    timestamp: DateTime<Utc>,
}

impl From<BinanceOpenInterestHist> for OpenInterestStat {
    fn from(record: BinanceOpenInterestHist) -> Self {
        Self {
            symbol: record.symbol,
            open_interest: record.sum_open_interest,
            notional: record.sum_open_interest_value,
            timestamp: record.timestamp,
        }
    }
}

#[async_trait]
impl MarketDataApi for BinanceFuturesApi {
    async fn day_stats_all(&self) -> Result<Vec<TickerSnapshot>, MonitorError> {
        let records: Vec<BinanceDayStats> = self.get_json("/fapi/v1/ticker/24hr").await?;

        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            match TickerSnapshot::validated(
                &record.symbol,
                record.last_price,
                record.price_change,
                record.price_change_percent,
                record.quote_volume,
                record.close_time,
            ) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(error) => {
                    debug!(symbol = %record.symbol, %error, "dropping invalid day stats record")
                }
            }
        }
        Ok(snapshots)
    }

    async fn funding_rate(&self, symbol: &str) -> Result<FundingSnapshot, MonitorError> {
        let record: BinancePremiumIndex = self
            .get_json(&format!("/fapi/v1/premiumIndex?symbol={symbol}"))
            .await?;
        Ok(record.into())
    }

    async fn open_interest(
        &self,
        symbol: &str,
        period: &str,
        limit: usize,
    ) -> Result<Vec<OpenInterestStat>, MonitorError> {
        let records: Vec<BinanceOpenInterestHist> = self
            .get_json(&format!(
                "/futures/data/openInterestHist?symbol={symbol}&period={period}&limit={limit}"
            ))
            .await?;
        Ok(records.into_iter().map(OpenInterestStat::from).collect())
    }
}
