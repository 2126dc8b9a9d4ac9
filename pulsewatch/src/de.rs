use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Deserialize a string-encoded decimal field, eg/ `"price": "50123.45"`.
pub fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let value: &str = Deserialize::deserialize(deserializer)?;
    value.trim().parse::<f64>().map_err(serde::de::Error::custom)
}

/// Deserialize an optional string-encoded decimal field, treating empty
/// strings as absent.
pub fn de_opt_str_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let value: Option<&str> = Option::deserialize(deserializer)?;
    match value {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a millisecond epoch timestamp, eg/ `"E": 1736424890123`.
pub fn de_u64_epoch_ms_as_datetime_utc<'de, D>(
    deserializer: D,
) -> Result<DateTime<Utc>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let epoch_ms: i64 = Deserialize::deserialize(deserializer)?;
    DateTime::from_timestamp_millis(epoch_ms)
        .ok_or_else(|| serde::de::Error::custom(format!("epoch ms out of range: {epoch_ms}")))
}

/// Deserialize an optional millisecond epoch timestamp.
pub fn de_opt_u64_epoch_ms_as_datetime_utc<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let value: Option<i64> = Option::deserialize(deserializer)?;
    Ok(value.and_then(DateTime::from_timestamp_millis))
}
