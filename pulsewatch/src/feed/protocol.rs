use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::de;
use crate::error::MonitorError;
use crate::market::TickerSnapshot;

/// Control frame sent to the venue to alter the live stream set.
///
/// Serializes to `{"method":"SUBSCRIBE","params":["btcusdt@ticker"],"id":1}`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    pub method: RequestMethod,
    pub params: Vec<String>,
    pub id: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Subscribe,
    Unsubscribe,
}

impl StreamRequest {
    pub fn subscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: RequestMethod::Subscribe,
            params,
            id,
        }
    }

    pub fn unsubscribe(params: Vec<String>, id: u64) -> Self {
        Self {
            method: RequestMethod::Unsubscribe,
            params,
            id,
        }
    }

    pub fn to_message(&self) -> Result<Message, MonitorError> {
        let payload = serde_json::to_string(self)?;
        Ok(Message::text(payload))
    }
}

/// Frame received from a combined-stream endpoint.
#[derive(Debug)]
pub enum InboundFrame {
    /// Market event wrapped in the `{"stream":...,"data":...}` envelope.
    Event { stream: SmolStr, data: Value },
    /// Acknowledgement for a previously issued [`StreamRequest`].
    Ack { id: u64, error: Option<String> },
    /// Valid JSON that matches neither shape. Logged and ignored upstream.
    Unknown,
}

/// Classify one text frame from the feed.
///
/// Non-JSON input is a validation error so the session can drop the frame
/// without tearing down the connection.
pub fn parse_frame(text: &str) -> Result<InboundFrame, MonitorError> {
    let mut value: Value = serde_json::from_str(text)?;

    if let Some(stream) = value.get("stream").and_then(Value::as_str) {
        let stream = SmolStr::new(stream);
        let data = value.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        return Ok(InboundFrame::Event { stream, data });
    }

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let error = value.get("error").map(|error| error.to_string());
        return Ok(InboundFrame::Ack { id, error });
    }

    Ok(InboundFrame::Unknown)
}

/// Rolling 24h statistics event as the venue emits it.
///
/// Numeric fields arrive as strings on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTicker {
    /// Instrument symbol, e.g. "BTCUSDT".
    #[serde(rename = "s")]
    pub symbol: SmolStr,
    /// Last traded price.
    #[serde(rename = "c", deserialize_with = "de::de_str_f64")]
    pub last_price: f64,
    /// Absolute price change over the rolling day.
    #[serde(rename = "p", deserialize_with = "de::de_str_f64")]
    pub price_change: f64,
    /// Relative price change over the rolling day, in percent.
    #[serde(rename = "P", deserialize_with = "de::de_str_f64")]
    pub price_change_percent: f64,
    /// Quote-denominated volume over the rolling day.
    #[serde(rename = "q", deserialize_with = "de::de_str_f64")]
    pub quote_volume: f64,
    /// Venue event time.
    #[serde(rename = "E", deserialize_with = "de::de_u64_epoch_ms_as_datetime_utc")]
    pub event_time: DateTime<Utc>,
}

impl TryFrom<RawTicker> for TickerSnapshot {
    type Error = MonitorError;

    fn try_from(raw: RawTicker) -> Result<Self, Self::Error> {
        TickerSnapshot::validated(
            &raw.symbol,
            raw.last_price,
            raw.price_change,
            raw.price_change_percent,
            raw.quote_volume,
            raw.event_time,
        )
    }
}

/// Decode an all-market ticker payload into validated snapshots.
///
/// The payload is an array for `!ticker@arr` and a single object for
/// per-symbol streams. Records that fail to decode or validate are
/// dropped individually so one bad entry never poisons the batch.
pub fn parse_ticker_batch(data: &Value) -> Vec<TickerSnapshot> {
    let records: &[Value] = match data {
        Value::Array(records) => records,
        single @ Value::Object(_) => std::slice::from_ref(single),
        other => {
            debug!(payload = %other, "unexpected ticker payload shape");
            return Vec::new();
        }
    };

    let mut snapshots = Vec::with_capacity(records.len());
    for record in records {
        let raw = match RawTicker::deserialize(record) {
            Ok(raw) => raw,
            Err(error) => {
                debug!(%error, "dropping undecodable ticker record");
                continue;
            }
        };
        match TickerSnapshot::try_from(raw) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(error) => {
                debug!(%error, "dropping invalid ticker record");
            }
        }
    }
    snapshots
}
