// Event envelope codec - wire shape of every live-channel message
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid {topic} payload: {source}")]
    Payload {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },

    #[error("expected a {expected} envelope, got {actual}")]
    TopicMismatch { expected: Topic, actual: Topic },
}

/// Server-to-client topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    MarketData,
    AssetUpdate,
    BidUpdate,
    SystemAlert,
    Heartbeat,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::MarketData,
        Topic::AssetUpdate,
        Topic::BidUpdate,
        Topic::SystemAlert,
        Topic::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MarketData => "market_data",
            Topic::AssetUpdate => "asset_update",
            Topic::BidUpdate => "bid_update",
            Topic::SystemAlert => "system_alert",
            Topic::Heartbeat => "heartbeat",
        }
    }
}

impl FromStr for Topic {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| CodecError::UnknownTopic(s.to_string()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of a `market_data` payload. See [`Envelope::market_tick`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTick {
    pub region: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatus {
    pub asset_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mw: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidStatus {
    pub bid_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAlert {
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// One variant per server topic. Payloads are kept exactly as received; their
/// shape belongs to the backend, so typed views are parsed on demand.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    MarketData(Value),
    AssetUpdate(Value),
    BidUpdate(Value),
    SystemAlert(Value),
    Heartbeat(Value),
}

impl Event {
    pub fn new(topic: Topic, payload: Value) -> Self {
        match topic {
            Topic::MarketData => Event::MarketData(payload),
            Topic::AssetUpdate => Event::AssetUpdate(payload),
            Topic::BidUpdate => Event::BidUpdate(payload),
            Topic::SystemAlert => Event::SystemAlert(payload),
            Topic::Heartbeat => Event::Heartbeat(payload),
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Event::MarketData(_) => Topic::MarketData,
            Event::AssetUpdate(_) => Topic::AssetUpdate,
            Event::BidUpdate(_) => Topic::BidUpdate,
            Event::SystemAlert(_) => Topic::SystemAlert,
            Event::Heartbeat(_) => Topic::Heartbeat,
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            Event::MarketData(payload)
            | Event::AssetUpdate(payload)
            | Event::BidUpdate(payload)
            | Event::SystemAlert(payload)
            | Event::Heartbeat(payload) => payload,
        }
    }
}

/// A received message. Never mutated after decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: Event,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: Event, timestamp: DateTime<Utc>) -> Self {
        Self { event, timestamp }
    }

    pub fn topic(&self) -> Topic {
        self.event.topic()
    }

    pub fn payload(&self) -> &Value {
        self.event.payload()
    }

    /// Parse the payload into any caller-defined shape.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        T::deserialize(self.payload()).map_err(|source| CodecError::Payload {
            topic: self.topic(),
            source,
        })
    }

    pub fn market_tick(&self) -> Result<MarketTick, CodecError> {
        self.typed(Topic::MarketData)
    }

    pub fn asset_status(&self) -> Result<AssetStatus, CodecError> {
        self.typed(Topic::AssetUpdate)
    }

    pub fn bid_status(&self) -> Result<BidStatus, CodecError> {
        self.typed(Topic::BidUpdate)
    }

    pub fn system_alert(&self) -> Result<SystemAlert, CodecError> {
        self.typed(Topic::SystemAlert)
    }

    /// A missing heartbeat payload reads as the empty heartbeat.
    pub fn heartbeat(&self) -> Result<Heartbeat, CodecError> {
        if self.topic() == Topic::Heartbeat && self.payload().is_null() {
            return Ok(Heartbeat::default());
        }
        self.typed(Topic::Heartbeat)
    }

    fn typed<T: DeserializeOwned>(&self, expected: Topic) -> Result<T, CodecError> {
        if self.topic() != expected {
            return Err(CodecError::TopicMismatch {
                expected,
                actual: self.topic(),
            });
        }
        self.parse_payload()
    }
}

/// Client-to-server control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Heartbeat,
    SubscribeMarket,
    SubscribeAssets,
    SubscribeBids,
    Unsubscribe { topic: Topic },
}

impl ClientEvent {
    pub fn topic_name(&self) -> &'static str {
        match self {
            ClientEvent::Heartbeat => "heartbeat",
            ClientEvent::SubscribeMarket => "subscribe_market",
            ClientEvent::SubscribeAssets => "subscribe_assets",
            ClientEvent::SubscribeBids => "subscribe_bids",
            ClientEvent::Unsubscribe { .. } => "unsubscribe",
        }
    }

    fn payload(&self) -> Value {
        match self {
            ClientEvent::Unsubscribe { topic } => serde_json::json!({ "topic": topic }),
            _ => Value::Object(Map::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    topic: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    topic: &'a str,
    payload: Value,
    timestamp: DateTime<Utc>,
}

/// Decode one text frame. Only malformed JSON or an unknown topic is rejected;
/// the payload is accepted in any shape. Frames without a timestamp are
/// stamped with `received_at`, as are frames whose timestamp is unreadable.
pub fn decode(frame: &str, received_at: DateTime<Utc>) -> Result<Envelope, CodecError> {
    let raw: RawEnvelope = serde_json::from_str(frame)?;
    let topic: Topic = raw.topic.parse()?;

    let timestamp = wire_timestamp(raw.timestamp.as_ref()).unwrap_or(received_at);
    let event = Event::new(topic, raw.payload);

    Ok(Envelope::new(event, timestamp))
}

/// RFC 3339 strings or epoch milliseconds; anything else is ignored.
fn wire_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|at| at.with_timezone(&Utc)),
        Value::Number(ms) => ms.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Encode a server envelope; used when re-publishing envelopes to local consumers.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let wire = WireEnvelope {
        topic: envelope.topic().as_str(),
        payload: envelope.payload().clone(),
        timestamp: envelope.timestamp,
    };
    Ok(serde_json::to_string(&wire)?)
}

pub fn encode_client(event: &ClientEvent, sent_at: DateTime<Utc>) -> Result<String, CodecError> {
    let wire = WireEnvelope {
        topic: event.topic_name(),
        payload: event.payload(),
        timestamp: sent_at,
    };
    Ok(serde_json::to_string(&wire)?)
}
